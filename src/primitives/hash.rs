use std::hash::Hasher;

use xxhash_rust::xxh64::Xxh64;

/// Streaming hasher handed to [`ContentHash::feed`]. Wraps a
/// fixed-seed xxh64 so implementors don't touch the hasher crate.
pub struct ContentHasher {
    inner: Xxh64,
}

impl ContentHasher {
    fn new() -> Self {
        Self {
            inner: Xxh64::new(0),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.inner.write(bytes);
    }

    fn finish(&self) -> u64 {
        self.inner.finish()
    }
}

/// Content hashing for vertex data. The engine compares hashes before
/// and after a program runs to decide whether mirrors need a fresh
/// copy, so the hash must be a pure function of the value's content.
///
/// Floats hash by bit pattern; `-0.0` and `0.0` therefore hash
/// differently, which only costs a redundant mirror sync.
pub trait ContentHash {
    fn feed(&self, hasher: &mut ContentHasher);
}

pub fn content_hash_of<T: ContentHash + ?Sized>(value: &T) -> u64 {
    let mut hasher = ContentHasher::new();
    value.feed(&mut hasher);
    hasher.finish()
}

macro_rules! impl_content_hash_int {
    ($($ty:ty),*) => {
        $(impl ContentHash for $ty {
            fn feed(&self, hasher: &mut ContentHasher) {
                hasher.write(&self.to_le_bytes());
            }
        })*
    };
}

impl_content_hash_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl ContentHash for f32 {
    fn feed(&self, hasher: &mut ContentHasher) {
        hasher.write(&self.to_bits().to_le_bytes());
    }
}

impl ContentHash for f64 {
    fn feed(&self, hasher: &mut ContentHasher) {
        hasher.write(&self.to_bits().to_le_bytes());
    }
}

impl ContentHash for bool {
    fn feed(&self, hasher: &mut ContentHasher) {
        hasher.write(&[*self as u8]);
    }
}

impl ContentHash for () {
    fn feed(&self, _hasher: &mut ContentHasher) {}
}

impl ContentHash for str {
    fn feed(&self, hasher: &mut ContentHasher) {
        hasher.write(&(self.len() as u64).to_le_bytes());
        hasher.write(self.as_bytes());
    }
}

impl ContentHash for String {
    fn feed(&self, hasher: &mut ContentHasher) {
        self.as_str().feed(hasher);
    }
}

impl<T: ContentHash> ContentHash for Vec<T> {
    fn feed(&self, hasher: &mut ContentHasher) {
        hasher.write(&(self.len() as u64).to_le_bytes());
        for item in self {
            item.feed(hasher);
        }
    }
}

impl<T: ContentHash> ContentHash for Option<T> {
    fn feed(&self, hasher: &mut ContentHasher) {
        match self {
            None => hasher.write(&[0]),
            Some(v) => {
                hasher.write(&[1]);
                v.feed(hasher);
            }
        }
    }
}

impl<A: ContentHash, B: ContentHash> ContentHash for (A, B) {
    fn feed(&self, hasher: &mut ContentHasher) {
        self.0.feed(hasher);
        self.1.feed(hasher);
    }
}
