use std::sync::{Arc, Mutex, PoisonError};

use forgebatch_core::{BatchError, BatchResult, ExecutionContext};

use super::{ItemReader, ItemStream, ItemWriter};

/// Reads from an in-memory list, saving its position under
/// `"{name}.read.count"` so a restarted step resumes after the last committed
/// item.
#[derive(Debug, Clone)]
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    position: usize,
    save_state: bool,
}

impl<T: Clone + Send> ListItemReader<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            position: 0,
            save_state: true,
        }
    }

    /// Without saved state every run starts from the first item.
    pub fn with_save_state(mut self, save_state: bool) -> Self {
        self.save_state = save_state;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T: Clone + Send> ItemStream for ListItemReader<T> {
    fn open(&mut self, context: &ExecutionContext) -> BatchResult<()> {
        self.position = 0;
        if !self.save_state {
            return Ok(());
        }
        if let Some(saved) = context.get_long(&self.position_key()) {
            let saved = usize::try_from(saved).map_err(|_| {
                BatchError::validation(format!("{}: negative saved position {saved}", self.name))
            })?;
            if saved > self.items.len() {
                return Err(BatchError::validation(format!(
                    "{}: saved position {saved} is past the end of {} items",
                    self.name,
                    self.items.len()
                )));
            }
            self.position = saved;
        }
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> BatchResult<()> {
        if self.save_state {
            // Positions are bounded by the list length, far below i64::MAX.
            context.put_long(self.position_key(), self.position as i64);
        }
        Ok(())
    }
}

impl<T: Clone + Send> ItemReader<T> for ListItemReader<T> {
    fn read(&mut self) -> BatchResult<Option<T>> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        Ok(item)
    }
}

/// Collects written items. Clones share one buffer.
#[derive(Debug)]
pub struct ListItemWriter<T> {
    written: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for ListItemWriter<T> {
    fn clone(&self) -> Self {
        Self {
            written: Arc::clone(&self.written),
        }
    }
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> ListItemWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<T> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> ItemStream for ListItemWriter<T> {}

impl<T: Clone + Send> ItemWriter<T> for ListItemWriter<T> {
    fn write(&mut self, items: &[T]) -> BatchResult<()> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(items);
        Ok(())
    }
}
