//! Sub-task fan-out and termination behavior across machines.

use std::sync::Arc;

use lattice::{
    Cluster, ContentHash, ContentHasher, EdgeDirection, Engine, EngineConfig, ExecutionStatus,
    GraphBuilder, SignalOrder,
};

const REPLICA_COUNT_TASK: u8 = 0;
const ZERO_MAP_TASK: u8 = 1;
const NEIGHBOR_SUM_TASK: u8 = 2;

#[derive(Clone, Debug, Default)]
struct Agg {
    value: u64,
    replicas: u64,
    zero_law: f64,
    neighbor_sum: u64,
}

impl ContentHash for Agg {
    fn feed(&self, hasher: &mut ContentHasher) {
        self.value.feed(hasher);
        self.replicas.feed(hasher);
        self.zero_law.feed(hasher);
        self.neighbor_sum.feed(hasher);
    }
}

fn register_tasks(engine: &Engine<Agg, (), ()>) {
    // One contribution per replica regardless of edges: the zero
    // value carries the count.
    engine.register_map_reduce(
        REPLICA_COUNT_TASK,
        |_c: &Agg, _e: &(), _n: &Agg| 0u64,
        |acc: &mut u64, v: u64| *acc += v,
        1u64,
    );
    // A map that returns zero under + must produce zero.
    engine.register_map_reduce(
        ZERO_MAP_TASK,
        |_c: &Agg, _e: &(), _n: &Agg| 0.0f64,
        |acc: &mut f64, v: f64| *acc += v,
        0.0f64,
    );
    engine.register_map_reduce(
        NEIGHBOR_SUM_TASK,
        |_c: &Agg, _e: &(), n: &Agg| n.value,
        |acc: &mut u64, v: u64| *acc += v,
        0u64,
    );
}

#[test]
fn spawn_fans_out_to_every_replica() {
    let results = Cluster::run(4, |dc| {
        // Center vertex on machine 0 with one neighbor mastered on
        // each other machine: mirrors are exactly {1, 2, 3}.
        let mut builder = GraphBuilder::new();
        builder.add_vertex_on(
            10,
            Agg {
                value: 7,
                ..Agg::default()
            },
            0,
        );
        for (gvid, owner, value) in [(11, 1, 100), (12, 2, 200), (13, 3, 300)] {
            builder.add_vertex_on(
                gvid,
                Agg {
                    value,
                    ..Agg::default()
                },
                owner,
            );
            builder.add_edge(10, gvid, ());
        }
        let graph = Arc::new(builder.build(dc.procid(), dc.numprocs()).unwrap());
        let engine =
            Engine::<Agg, (), ()>::new(&dc, Arc::clone(&graph), EngineConfig::small()).unwrap();
        register_tasks(&engine);
        engine.signal(10, ());
        let status = engine.start(|ctx, _msg: &()| {
            let replicas: u64 = ctx.map_reduce(REPLICA_COUNT_TASK, EdgeDirection::Out);
            let zero_law: f64 = ctx.map_reduce(ZERO_MAP_TASK, EdgeDirection::Out);
            let neighbor_sum: u64 = ctx.map_reduce(NEIGHBOR_SUM_TASK, EdgeDirection::Out);
            let mut data = ctx.data_mut();
            data.replicas = replicas;
            data.zero_law = zero_law;
            data.neighbor_sum = neighbor_sum;
        });
        assert_eq!(status, ExecutionStatus::TaskDepletion);
        dc.full_barrier();
        let lvid = graph.global_to_local(10).unwrap();
        let center = graph.vertex_data(lvid).lock().clone();
        let subtasks = engine.num_subtasks();
        let updates = engine.num_updates();
        dc.full_barrier();
        (center, subtasks, updates)
    });

    for (center, _, _) in &results {
        // Mirror copies were overwritten by the post-program sync, so
        // every machine sees the combined results.
        assert_eq!(center.replicas, 4, "self plus three mirrors");
        assert_eq!(center.zero_law, 0.0);
        assert_eq!(center.neighbor_sum, 100 + 200 + 300);
    }
    let total_updates: u64 = results.iter().map(|(_, _, u)| u).sum();
    assert_eq!(total_updates, 1, "only the one signalled program ran");
    // Three spawns, each executed once on each of the three mirrors.
    let total_subtasks: u64 = results.iter().map(|(_, s, _)| s).sum();
    assert_eq!(total_subtasks, 9);
}

#[test]
fn spawn_without_mirrors_resolves_locally() {
    let results = Cluster::run(1, |dc| {
        let mut builder = GraphBuilder::new();
        builder.add_vertex(
            0,
            Agg {
                value: 1,
                ..Agg::default()
            },
        );
        builder.add_vertex(
            1,
            Agg {
                value: 5,
                ..Agg::default()
            },
        );
        builder.add_edge(0, 1, ());
        let graph = Arc::new(builder.build(0, 1).unwrap());
        let engine =
            Engine::<Agg, (), ()>::new(&dc, Arc::clone(&graph), EngineConfig::small()).unwrap();
        register_tasks(&engine);
        engine.signal(0, ());
        engine.start(|ctx, _msg: &()| {
            let replicas: u64 = ctx.map_reduce(REPLICA_COUNT_TASK, EdgeDirection::Out);
            let neighbor_sum: u64 = ctx.map_reduce(NEIGHBOR_SUM_TASK, EdgeDirection::Out);
            let mut data = ctx.data_mut();
            data.replicas = replicas;
            data.neighbor_sum = neighbor_sum;
        });
        let lvid = graph.global_to_local(0).unwrap();
        let data = graph.vertex_data(lvid).lock().clone();
        data
    });
    // Count-down was 1: the local map alone resolved the future.
    assert_eq!(results[0].replicas, 1);
    assert_eq!(results[0].neighbor_sum, 5);
}

#[test]
fn empty_signal_set_terminates_with_zero_updates() {
    let results = Cluster::run(2, |dc| {
        let mut builder = GraphBuilder::new();
        builder.add_vertex(0, Agg::default());
        builder.add_vertex(1, Agg::default());
        builder.add_edge(0, 1, ());
        let graph = Arc::new(builder.build(dc.procid(), dc.numprocs()).unwrap());
        let engine =
            Engine::<Agg, (), ()>::new(&dc, Arc::clone(&graph), EngineConfig::small()).unwrap();
        register_tasks(&engine);
        let status = engine.start(|_ctx, _msg: &()| {
            unreachable!("nothing was signalled");
        });
        (status, engine.num_updates())
    });
    for (status, updates) in results {
        assert_eq!(status, ExecutionStatus::TaskDepletion);
        assert_eq!(updates, 0);
    }
}

#[test]
fn signal_vset_runs_only_the_selected_vertices() {
    let results = Cluster::run(2, |dc| {
        let mut builder = GraphBuilder::new();
        for gvid in 0..6 {
            builder.add_vertex(gvid, Agg::default());
        }
        for gvid in 0..5 {
            builder.add_edge(gvid, gvid + 1, ());
        }
        let graph = Arc::new(builder.build(dc.procid(), dc.numprocs()).unwrap());
        let engine =
            Engine::<Agg, (), ()>::new(&dc, Arc::clone(&graph), EngineConfig::small()).unwrap();
        register_tasks(&engine);
        engine.signal_vset(&[1, 4, 5], (), SignalOrder::Ascending);
        engine.start(|ctx, _msg: &()| {
            // Vertex 5 pokes vertex 0, which it only holds as a
            // ghost: the signal lands on the local scheduler and a
            // fiber forwards it to the owner machine.
            if ctx.vertex_id() == 5 {
                ctx.signal(0, ());
            }
            ctx.data_mut().value += 1;
        });
        dc.full_barrier();
        let values: Vec<u64> = (0..6)
            .map(|gvid| {
                let lvid = graph.global_to_local(gvid).unwrap();
                graph.vertex_data(lvid).lock().value
            })
            .collect();
        dc.full_barrier();
        values
    });
    for values in &results {
        assert_eq!(values, &vec![1, 1, 0, 0, 1, 1]);
    }
}
