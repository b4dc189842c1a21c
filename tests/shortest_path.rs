//! Single-source shortest path on a four-vertex line, partitioned
//! over two machines.

use std::sync::{Arc, Once};

use lattice::{
    Cluster, EdgeDirection, Engine, EngineConfig, ExecutionStatus, GraphBuilder, SignalOrder,
};
use tracing_subscriber::EnvFilter;

const RELAX_TASK: u8 = 0;
const INF: f64 = f64::INFINITY;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[test]
fn line_graph_distances_converge() {
    init_tracing();
    let results = Cluster::run(2, |dc| {
        // 0 -> 1 -> 2 -> 3, unit weights; evens live on machine 0 and
        // odds on machine 1, so every edge crosses machines.
        let mut builder = GraphBuilder::new();
        builder.add_vertex(0, 0.0f64);
        for gvid in 1..4 {
            builder.add_vertex(gvid, INF);
        }
        for gvid in 0..3 {
            builder.add_edge(gvid, gvid + 1, 1.0f64);
        }
        let graph = Arc::new(builder.build(dc.procid(), dc.numprocs()).unwrap());
        let engine =
            Engine::<f64, f64, ()>::new(&dc, Arc::clone(&graph), EngineConfig::small()).unwrap();
        engine.register_map_reduce(
            RELAX_TASK,
            |_center: &f64, weight: &f64, source: &f64| source + weight,
            |acc: &mut f64, candidate: f64| *acc = acc.min(candidate),
            INF,
        );
        engine.signal_all((), SignalOrder::Ascending);
        let status = engine.start(|ctx, _msg: &()| {
            let relaxed: f64 = ctx.map_reduce(RELAX_TASK, EdgeDirection::In);
            if relaxed < *ctx.data() {
                *ctx.data_mut() = relaxed;
                ctx.broadcast_signal(EdgeDirection::Out, ());
            }
        });
        assert_eq!(status, ExecutionStatus::TaskDepletion);
        dc.full_barrier();
        let dists: Vec<f64> = (0..4)
            .map(|gvid| {
                let lvid = graph.global_to_local(gvid).unwrap();
                *graph.vertex_data(lvid).lock()
            })
            .collect();
        let updates = engine.num_updates();
        dc.full_barrier();
        (dists, updates)
    });

    for (dists, _) in &results {
        // Every machine sees the converged distances on its own
        // copies, mirrors included.
        assert_eq!(dists, &vec![0.0, 1.0, 2.0, 3.0]);
    }
    let total_updates: u64 = results.iter().map(|(_, updates)| updates).sum();
    // Each vertex ran at least once from the initial signal_all.
    assert!(total_updates >= 4, "ran {total_updates} programs");
}
