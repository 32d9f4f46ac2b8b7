//! Shared holding register storage.
//!
//! Every session reads and writes the same store, so all access goes
//! through one mutex. Range operations take the lock once for the whole
//! range; a reader never sees half of a multi-register write.

use mbtcp_common::config::{RegisterConfig, MAX_REGISTER_COUNT};
use mbtcp_common::error::{MbError, MbResult};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// 16-bit value held by one holding register.
pub type Word = u16;

/// Fixed-size array of holding registers, safe to share between sessions.
#[derive(Debug)]
pub struct RegisterStore {
    words: Mutex<Vec<Word>>,
}

impl RegisterStore {
    /// Create a store of `size` registers, all zero.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_values(vec![0; size])
    }

    /// Create a store holding exactly `values`.
    #[must_use]
    pub fn with_values(values: Vec<Word>) -> Self {
        Self {
            words: Mutex::new(values),
        }
    }

    /// Create a store sized by `config` with its preload blocks applied in order.
    ///
    /// # Errors
    ///
    /// Returns [`MbError::Config`] for a size outside `1..=65536` and
    /// [`MbError::AddressOutOfRange`] for a preload block that does not fit.
    pub fn from_config(config: &RegisterConfig) -> MbResult<Self> {
        if config.size == 0 || config.size > MAX_REGISTER_COUNT {
            return Err(MbError::Config(format!(
                "register store size {} outside 1..={MAX_REGISTER_COUNT}",
                config.size
            )));
        }

        let store = Self::new(config.size);
        for block in &config.preload {
            store.write_range(usize::from(block.address), &block.values)?;
            debug!(
                address = block.address,
                count = block.values.len(),
                "Preloaded registers"
            );
        }
        Ok(store)
    }

    // A panic while holding the lock cannot leave a word half-written.
    fn lock(&self) -> MutexGuard<'_, Vec<Word>> {
        self.words.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True for a zero-sized store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Read a single register.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Word> {
        self.lock().get(index).copied()
    }

    /// Write a single register.
    ///
    /// # Errors
    ///
    /// Returns [`MbError::AddressOutOfRange`] if `index` is past the end of the store.
    pub fn set(&self, index: usize, value: Word) -> MbResult<()> {
        let mut words = self.lock();
        let size = words.len();
        let slot = words
            .get_mut(index)
            .ok_or(MbError::AddressOutOfRange { address: index, size })?;
        *slot = value;
        Ok(())
    }

    /// Read `quantity` consecutive registers starting at `start`.
    ///
    /// Returns `None` if any part of the range lies outside the store.
    #[must_use]
    pub fn read_range(&self, start: usize, quantity: usize) -> Option<Vec<Word>> {
        let words = self.lock();
        let end = start.checked_add(quantity)?;
        words.get(start..end).map(<[Word]>::to_vec)
    }

    /// Write `values` into consecutive registers starting at `start`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`MbError::AddressOutOfRange`] without touching the store if the
    /// range does not fit.
    pub fn write_range(&self, start: usize, values: &[Word]) -> MbResult<()> {
        let mut words = self.lock();
        let size = words.len();
        let end = start
            .checked_add(values.len())
            .filter(|&end| end <= size)
            .ok_or(MbError::AddressOutOfRange {
                address: start,
                size,
            })?;
        words[start..end].copy_from_slice(values);
        Ok(())
    }

    /// Copy of every register, for inspection and shutdown reporting.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Word> {
        self.lock().clone()
    }
}
