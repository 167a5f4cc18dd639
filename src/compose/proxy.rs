//! Printing front of a [`Compose`] implementation.

use std::io::Write;
use std::sync::{Arc, Mutex};

use eyre::{eyre, Result};

use super::{
    Compose, CreateOptions, Event, EventsOptions, ListOptions, PullOptions, RemoveOptions, Stack,
    StartOptions, StopOptions,
};
use crate::io::Shutdown;
use crate::project::Project;

/// Announces each operation on its output, then forwards it.
pub struct ServiceProxy<C: Compose> {
    api: C,
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl<C: Compose> ServiceProxy<C> {
    pub fn new(api: C) -> Self {
        Self::with_output(api, Box::new(std::io::stdout()))
    }

    pub fn with_output(api: C, out: Box<dyn Write + Send>) -> Self {
        Self {
            api,
            out: Arc::new(Mutex::new(out)),
        }
    }

    pub fn api(&self) -> &C {
        &self.api
    }

    fn say(&self, line: &str) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| eyre!("output lock poisoned"))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    /// Stacks known to the engine, without printing them.
    pub async fn stacks(&self, options: ListOptions) -> Result<Vec<Stack>> {
        self.api.list(options).await
    }

    pub async fn print(&self, options: ListOptions) -> Result<Vec<Stack>> {
        let stacks = self.stacks(options).await?;
        for stack in &stacks {
            self.say(&format!("Stack: {}", stack))?;
        }
        Ok(stacks)
    }

    pub async fn create(&self, project: &Project, options: CreateOptions) -> Result<()> {
        self.say(&format!("Creating project: {}", project.name))?;
        self.api.create(project, options).await
    }

    pub async fn pull(&self, project: &Project, options: PullOptions) -> Result<()> {
        self.say(&format!("Pulling project: {}", project.name))?;
        self.api.pull(project, options).await
    }

    pub async fn start(&self, project: &Project, options: StartOptions) -> Result<()> {
        self.say(&format!("Starting project: {}", project.name))?;
        self.api.start(project, options).await
    }

    pub async fn stop(&self, project: &Project, options: StopOptions) -> Result<()> {
        self.say(&format!("Stopping project: {}", project.name))?;
        self.api.stop(project, options).await
    }

    pub async fn remove(&self, project: &Project, options: RemoveOptions) -> Result<()> {
        self.say(&format!("Removing project: {}", project.name))?;
        self.api.remove(project, options).await
    }

    /// Stream events of the project, printing each one, until the stream
    /// ends or `shutdown` fires.
    pub async fn event(&self, project_name: &str, json: bool, shutdown: Shutdown) -> Result<()> {
        let out = Arc::clone(&self.out);
        let consumer = move |event: Event| -> Result<()> {
            let line = if json {
                serde_json::to_string(&event)?
            } else {
                format!("Event: {}", event)
            };
            let mut out = out.lock().map_err(|_| eyre!("output lock poisoned"))?;
            writeln!(out, "{}", line)?;
            out.flush()?;
            Ok(())
        };
        self.api
            .events(
                project_name,
                EventsOptions::new(consumer).with_shutdown(shutdown),
            )
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::shutdown_channel;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;

    /// Records calls and replays canned events.
    #[derive(Default)]
    pub(crate) struct FakeCompose {
        pub calls: Mutex<Vec<String>>,
        pub events: Vec<Event>,
        pub fail_on: Option<&'static str>,
    }

    impl FakeCompose {
        fn record(&self, call: &str) -> Result<()> {
            self.calls.lock().unwrap().push(call.to_string());
            if self.fail_on == Some(call) {
                return Err(eyre!("{} failed", call));
            }
            Ok(())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Compose for FakeCompose {
        async fn list(&self, _options: ListOptions) -> Result<Vec<Stack>> {
            self.record("list")?;
            Ok(vec![Stack {
                id: "wp".to_string(),
                name: "wp".to_string(),
                status: "running(2)".to_string(),
                config_files: "/srv/wp/docker-compose.yml".to_string(),
            }])
        }
        async fn create(&self, _project: &Project, _options: CreateOptions) -> Result<()> {
            self.record("create")
        }
        async fn start(&self, _project: &Project, _options: StartOptions) -> Result<()> {
            self.record("start")
        }
        async fn stop(&self, _project: &Project, _options: StopOptions) -> Result<()> {
            self.record("stop")
        }
        async fn remove(&self, _project: &Project, _options: RemoveOptions) -> Result<()> {
            self.record("remove")
        }
        async fn pull(&self, _project: &Project, _options: PullOptions) -> Result<()> {
            self.record("pull")
        }
        async fn events(&self, _project_name: &str, mut options: EventsOptions) -> Result<()> {
            self.record("events")?;
            for event in self.events.clone() {
                (options.consumer)(event)?;
            }
            if let Some(mut shutdown) = options.shutdown {
                shutdown.wait().await;
            }
            Ok(())
        }
    }

    pub(crate) fn project() -> Project {
        Project {
            name: "wp".to_string(),
            working_dir: PathBuf::from("/srv/wp"),
            compose_files: vec![PathBuf::from("/srv/wp/docker-compose.yml")],
            env_file: None,
            environment: HashMap::new(),
            services: Vec::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            disabled_services: Vec::new(),
        }
    }

    /// Output sink that can be read back after the proxy wrote to it.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn announces_and_forwards() {
        let buf = SharedBuf::default();
        let proxy = ServiceProxy::with_output(FakeCompose::default(), Box::new(buf.clone()));
        let project = project();

        proxy.print(ListOptions { all: true }).await.unwrap();
        proxy.create(&project, CreateOptions::default()).await.unwrap();
        proxy.start(&project, StartOptions::default()).await.unwrap();

        assert_eq!(proxy.api().calls(), vec!["list", "create", "start"]);
        assert_eq!(
            buf.contents(),
            "Stack: {ID:wp Name:wp Status:running(2) ConfigFiles:/srv/wp/docker-compose.yml}\n\
             Creating project: wp\n\
             Starting project: wp\n"
        );
    }

    #[tokio::test]
    async fn stacks_are_listed_silently() {
        let buf = SharedBuf::default();
        let proxy = ServiceProxy::with_output(FakeCompose::default(), Box::new(buf.clone()));
        let stacks = proxy.stacks(ListOptions { all: false }).await.unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].status, "running(2)");
        assert_eq!(proxy.api().calls(), vec!["list"]);
        assert!(buf.contents().is_empty());
    }

    #[tokio::test]
    async fn errors_are_passed_through() {
        let fake = FakeCompose {
            fail_on: Some("stop"),
            ..Default::default()
        };
        let proxy = ServiceProxy::with_output(fake, Box::new(SharedBuf::default()));
        let err = proxy
            .stop(&project(), StopOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "stop failed");
    }

    #[tokio::test]
    async fn events_are_printed_until_shutdown() {
        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), "wp-db-1".to_string());
        attrs.insert(crate::project::labels::SERVICE.to_string(), "db".to_string());
        let event = Event::from_parts(Utc.timestamp_opt(0, 0).unwrap(), "start", &attrs).unwrap();
        let fake = FakeCompose {
            events: vec![event],
            ..Default::default()
        };
        let buf = SharedBuf::default();
        let proxy = Arc::new(ServiceProxy::with_output(fake, Box::new(buf.clone())));
        let (trigger, shutdown) = shutdown_channel();

        let task = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.event("wp", false, shutdown).await })
        };
        trigger.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(
            buf.contents(),
            "Event: 1970-01-01 00:00:00.000000 container start wp-db-1 (name=wp-db-1)\n"
        );
    }
}
