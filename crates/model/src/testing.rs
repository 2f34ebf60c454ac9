//! A source that records when it is opened and closed.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct Journal {
    opened: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug)]
pub struct TestSource {
    name: String,
    cosmetic: String,
    journal: Journal,
    parent: Option<Handle>,
    fail_first: Option<Arc<AtomicBool>>,
}

impl TestSource {
    pub fn top(name: &str, journal: &Journal) -> Self {
        Self { name: name.into(), cosmetic: String::new(), journal: journal.clone(), parent: None, fail_first: None }
    }

    pub fn derived(name: &str, journal: &Journal) -> Self {
        let parent = Arc::new(TestSource::top(&format!("{name}-parent"), journal));
        Self { parent: Some(Handle::new(parent, name)), ..Self::top(name, journal) }
    }

    pub fn with_cosmetic(mut self, cosmetic: &str) -> Self {
        self.cosmetic = cosmetic.into();
        self
    }

    pub fn failing_first(mut self) -> Self {
        self.fail_first = Some(Arc::new(AtomicBool::new(true)));
        self
    }
}

#[async_trait]
impl Source for TestSource {
    fn type_label(&self) -> &'static str {
        "test"
    }

    fn eq_properties(&self) -> Value {
        json!({"name": self.name})
    }

    fn handle(&self) -> Option<&Handle> {
        self.parent.as_ref()
    }

    fn censor(&self) -> SourceRef {
        Arc::new(self.clone())
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("name".into(), self.name.clone().into());
        obj
    }

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        if let Some(flag) = &self.fail_first
            && flag.swap(false, Ordering::SeqCst)
        {
            exn::bail!(ErrorKind::Unavailable(self.name.clone()));
        }
        self.journal.opened.lock().unwrap().push(self.name.clone());
        let closed = self.journal.closed.clone();
        let name = self.name.clone();
        Ok(Opened::new(self.name.clone()).with_close(move || closed.lock().unwrap().push(name)))
    }

    fn handles<'a>(self: Arc<Self>, _sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        let source: SourceRef = self;
        Box::pin(futures::stream::iter(["a", "b"].map(move |p| Ok(Handle::new(source.clone(), p)))))
    }

    fn follow<'a>(&self, handle: &Handle, _sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(TestResource { handle: handle.clone() })
    }
}

struct TestResource {
    handle: Handle,
}

#[async_trait]
impl Resource for TestResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.handle.relative_path.len() as u64)
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.handle.relative_path.clone().into_bytes()))
    }
}
