//! In-crate fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use url::Url;

use crate::error::{Result, WorkerError};
use crate::http::{Network, Request, Response};
use crate::notify::{Notification, NotificationSink};

pub fn origin() -> Url {
    Url::parse("http://localhost:3000/").unwrap()
}

/// Scripted network keyed by URL path. Unknown paths answer 404.
#[derive(Default)]
pub struct FakeNetwork {
    replies: Mutex<HashMap<String, Option<Response>>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer 200 for each path, echoing the path as the body.
    pub fn serving(paths: &[&str]) -> Self {
        let network = Self::new();
        for path in paths {
            network.respond(path, Response::new(200, path.as_bytes()));
        }
        network
    }

    pub fn respond(&self, path: &str, response: Response) {
        self.replies.lock().unwrap().insert(path.to_string(), Some(response));
    }

    /// Make requests for `path` fail at the transport level.
    pub fn fail(&self, path: &str) {
        self.replies.lock().unwrap().insert(path.to_string(), None);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().get(request.url.path()).cloned();
        match reply {
            Some(Some(response)) => Ok(response),
            Some(None) => Err(WorkerError::Unreachable(format!("{} is offline", request.url))),
            None => Ok(Response::new(404, "not found")),
        }
    }
}

/// Sink that records every notification it is asked to show.
pub struct RecordingSink {
    granted: AtomicBool,
    shown: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            shown: Mutex::new(Vec::new()),
        }
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.shown().into_iter().map(|n| n.title).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn permission_granted(&self) -> bool {
        self.granted.load(Ordering::Relaxed)
    }

    async fn show(&self, notification: Notification) -> Result<()> {
        self.shown.lock().unwrap().push(notification);
        Ok(())
    }
}
