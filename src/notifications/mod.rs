// SPDX-License-Identifier: Apache-2.0

//! Operator notifications (alarm breaches, stalled files).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::BoxError;
use tracing::{error, warn};

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> NotifyFuture<'a>;
}

/// Delivers notifications as warning events of the process log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    tag: Option<String>,
}

impl LogNotifier {
    pub fn new(tag: Option<String>) -> Self {
        Self { tag }
    }
}

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> NotifyFuture<'a> {
        Box::pin(async move {
            warn!(
                tag = self.tag.as_deref().unwrap_or(""),
                subject, body, "Notification"
            );
            Ok(())
        })
    }
}

/// Send a notification in the background. Delivery errors are logged.
pub fn spawn_notify(notifier: Arc<dyn Notifier>, subject: String, body: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&subject, &body).await {
            error!(subject, error = %e, "Failed to send notification");
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every subject it was asked to deliver.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) subjects: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub(crate) fn subjects(&self) -> Vec<String> {
            self.subjects.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify<'a>(&'a self, subject: &'a str, _body: &'a str) -> NotifyFuture<'a> {
            Box::pin(async move {
                self.subjects.lock().unwrap().push(subject.to_string());
                Ok(())
            })
        }
    }
}
