//! Per-inode generation tracking
//!
//! The counter sits behind its own small mutex rather than the inode lock, so
//! staleness checks never wait behind a long directory operation. It is never
//! held across a backing filesystem call.

use crate::error::{Error, Result};
use parking_lot::Mutex;

/// Generation value plus the half-refreshed marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IiGen {
    pub generation: u32,
    pub half_refreshed: bool,
}

/// How far an inode's shadow table can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Generation matches the superblock and the table is complete
    Consistent,
    /// A refresh is in flight; the table may be incomplete
    Refreshing,
    /// Branch configuration changed since the last refresh
    Stale,
}

#[derive(Debug)]
pub struct GenerationCounter {
    inner: Mutex<IiGen>,
}

impl GenerationCounter {
    /// Counter starting at `generation`, fully refreshed
    pub fn new(generation: u32) -> Self {
        Self {
            inner: Mutex::new(IiGen {
                generation,
                half_refreshed: false,
            }),
        }
    }

    /// Current generation value
    pub fn read(&self) -> u32 {
        self.inner.lock().generation
    }

    /// Generation and refresh flag, read together
    pub fn snapshot(&self) -> IiGen {
        *self.inner.lock()
    }

    /// Adopt the superblock generation, marking the table half-refreshed or not
    pub fn update(&self, sigen: u32, half: bool) {
        let mut gen = self.inner.lock();
        gen.generation = sigen;
        gen.half_refreshed = half;
    }

    pub(crate) fn restore(&self, saved: IiGen) {
        *self.inner.lock() = saved;
    }

    /// Mark a refresh in progress without touching the generation
    pub fn begin_refresh(&self) -> IiGen {
        let mut gen = self.inner.lock();
        let saved = *gen;
        gen.half_refreshed = true;
        saved
    }

    /// Bump the generation and return the new value
    pub fn increment(&self) -> u32 {
        let mut gen = self.inner.lock();
        gen.generation = gen.generation.wrapping_add(1);
        gen.generation
    }

    /// Poison: force the next revalidation to redo the lookup
    pub fn decrement(&self) -> u32 {
        let mut gen = self.inner.lock();
        gen.generation = gen.generation.wrapping_sub(1);
        gen.generation
    }

    /// Check against the superblock generation
    pub fn test(&self, sigen: u32) -> Result<()> {
        let current = self.read();
        if current != sigen {
            return Err(Error::StaleGeneration {
                cached: sigen,
                current,
            });
        }
        Ok(())
    }

    /// Freshness against the superblock generation `sigen`
    pub fn state(&self, sigen: u32) -> Freshness {
        let gen = self.snapshot();
        if gen.half_refreshed {
            Freshness::Refreshing
        } else if gen.generation != sigen {
            Freshness::Stale
        } else {
            Freshness::Consistent
        }
    }

    /// Record the current generation for a later `verify`
    pub fn stamp(&self) -> GenerationStamp {
        GenerationStamp(self.read())
    }
}

/// Generation observed when a reference was cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationStamp(pub u32);

impl GenerationStamp {
    /// Fail with `StaleGeneration` if `counter` moved since the stamp
    pub fn verify(self, counter: &GenerationCounter) -> Result<()> {
        let current = counter.read();
        if current != self.0 {
            return Err(Error::StaleGeneration {
                cached: self.0,
                current,
            });
        }
        Ok(())
    }
}

/// A cached value tagged with the generation it was observed under
#[derive(Debug, Clone)]
pub struct Stamped<T> {
    value: T,
    stamp: GenerationStamp,
}

impl<T> Stamped<T> {
    pub fn new(value: T, counter: &GenerationCounter) -> Self {
        Self {
            value,
            stamp: counter.stamp(),
        }
    }

    /// None
    pub fn stamp(&self) -> GenerationStamp {
        self.stamp
    }

    /// The cached value, if the generation has not moved
    pub fn verify(&self, counter: &GenerationCounter) -> Result<&T> {
        self.stamp.verify(counter)?;
        Ok(&self.value)
    }

    pub(crate) fn value_unchecked(&self) -> &T {
        &self.value
    }

    /// Bypass verification
    pub fn into_inner(self) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_decrement_poisons_stamp() {
        let counter = GenerationCounter::new(5);
        let cached = Stamped::new("entry", &counter);
        assert_eq!(*cached.verify(&counter).unwrap(), "entry");

        assert_eq!(counter.decrement(), 4);
        match cached.verify(&counter) {
            Err(Error::StaleGeneration { cached, current }) => {
                assert_eq!(cached, 5);
                assert_eq!(current, 4);
            }
            other => panic!("expected stale generation, got {:?}", other),
        }
    }

    #[test]
    fn test_freshness_states() {
        let counter = GenerationCounter::new(1);
        assert_eq!(counter.state(1), Freshness::Consistent);
        assert_eq!(counter.state(2), Freshness::Stale);

        let saved = counter.begin_refresh();
        assert_eq!(counter.state(2), Freshness::Refreshing);
        counter.update(2, false);
        assert_eq!(counter.state(2), Freshness::Consistent);

        counter.restore(saved);
        assert_eq!(counter.snapshot(), IiGen { generation: 1, half_refreshed: false });
    }

    #[test]
    fn test_against_superblock() {
        let counter = GenerationCounter::new(3);
        assert!(counter.test(3).is_ok());
        assert!(counter.test(4).is_err());
    }

    #[test]
    fn test_wrapping() {
        let counter = GenerationCounter::new(0);
        assert_eq!(counter.decrement(), u32::MAX);
        assert_eq!(counter.increment(), 0);
    }

    #[test]
    fn test_concurrent_updates_not_lost() {
        let counter = Arc::new(GenerationCounter::new(0));
        let threads = 8;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.increment();
                        let _ = counter.read();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.read(), threads * 10_000);
    }
}
