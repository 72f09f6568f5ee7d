//! User-facing notification surface

use classifier::ClassifiedError;

/// Receives every classified failure, fire-and-forget.
///
/// Implementations should not block; anything slow belongs on a spawned task.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, error: &ClassifiedError);
}

impl<F> NotificationSink for F
where
    F: Fn(&ClassifiedError) + Send + Sync,
{
    fn notify(&self, error: &ClassifiedError) {
        self(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classifier::ErrorKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let sink: Arc<dyn NotificationSink> =
            Arc::new(move |e: &ClassifiedError| recorder.lock().push(e.kind));

        sink.notify(&ClassifiedError::new(ErrorKind::NotFound, "gone", Some(404)));
        assert_eq!(*seen.lock(), vec![ErrorKind::NotFound]);
    }
}
