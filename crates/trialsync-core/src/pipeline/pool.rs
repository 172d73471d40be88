//! Reusable object pool for serialization buffers.

use parking_lot::Mutex;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Reset<T>,
    max_size: usize,
}

impl<T> ObjectPool<T> {
    pub fn new(
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
        max_size: usize,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            reset: Box::new(reset),
            max_size,
        }
    }

    /// Take a pooled object or build a new one.
    pub fn acquire(&self) -> T {
        self.items.lock().pop().unwrap_or_else(|| (self.factory)())
    }

    /// Return an object. It is reset first and dropped if the pool is full.
    pub fn release(&self, mut item: T) {
        (self.reset)(&mut item);
        let mut items = self.items.lock();
        if items.len() < self.max_size {
            items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl ObjectPool<Vec<u8>> {
    /// Pool of byte buffers with `capacity` preallocated.
    pub fn buffers(capacity: usize, max_size: usize) -> Self {
        Self::new(move || Vec::with_capacity(capacity), Vec::clear, max_size)
    }
}
