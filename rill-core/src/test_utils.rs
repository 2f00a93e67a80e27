//! Test helpers for exercising flows. Enabled with the `test-utils` feature.

use crate::error::StreamError;
use crate::flow::Observer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// An observer that records everything it sees, shareable across tasks.
#[derive(Debug, Default)]
pub struct Collector<T> {
    values: Arc<Mutex<Vec<T>>>,
    errors: Arc<Mutex<Vec<StreamError>>>,
    completed: Arc<AtomicBool>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            errors: self.errors.clone(),
            completed: self.completed.clone(),
        }
    }
}

impl<T: Clone> Collector<T> {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Everything delivered so far, in order.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().expect("collector lock").clone()
    }

    /// Errors delivered so far. The contract allows at most one.
    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().expect("collector lock").clone()
    }

    /// Whether `on_complete` fired.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send> Observer<T> for Collector<T> {
    fn on_next(&mut self, value: T) {
        self.values.lock().expect("collector lock").push(value);
    }

    fn on_error(&mut self, error: StreamError) {
        self.errors.lock().expect("collector lock").push(error);
    }

    fn on_complete(&mut self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}
