pub mod compose;
pub mod config;
pub mod io;
pub mod logging;
pub mod project;

use std::sync::Arc;

use compose::{
    Compose, CreateOptions, ListOptions, PullOptions, RemoveOptions, ServiceProxy, StartOptions,
    StopOptions,
};
use eyre::Result;
use io::handler::TaskSlot;
use io::Shutdown;
use log::{error, info};
use project::Project;

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkthroughOptions {
    pub pull: bool,
    pub events: bool,
}

/// List, create, start, stop and remove the project, listing stacks after
/// every step. Lifecycle events are streamed in the background meanwhile.
/// The first failing step ends the run.
pub async fn run_walkthrough<C: Compose + 'static>(
    proxy: Arc<ServiceProxy<C>>,
    project: &Project,
    options: WalkthroughOptions,
    shutdown: Shutdown,
) -> Result<()> {
    let mut events = TaskSlot::new();
    if options.events {
        let proxy = Arc::clone(&proxy);
        let name = project.name.clone();
        let t = tokio::spawn(async move {
            if let Err(err) = proxy.event(&name, false, shutdown).await {
                error!("Event stream stopped: {:#}", err);
            }
        });
        events.replace(t).await;
    }

    let all = ListOptions { all: true };
    let result = async {
        proxy.print(all).await?;
        if options.pull {
            proxy.pull(project, PullOptions::default()).await?;
        }
        proxy.create(project, CreateOptions::default()).await?;
        proxy.print(all).await?;
        proxy.start(project, StartOptions::default()).await?;
        proxy.print(all).await?;
        proxy.stop(project, StopOptions::default()).await?;
        proxy.print(all).await?;
        proxy.remove(project, RemoveOptions::default()).await?;
        proxy.print(all).await?;
        Ok(())
    }
    .await;

    events.abort_current_task().await;
    info!("Walkthrough of {} finished", project.name);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::proxy::tests::{project, FakeCompose, SharedBuf};
    use crate::io::shutdown_channel;

    #[tokio::test]
    async fn walkthrough_runs_the_fixed_sequence() {
        let buf = SharedBuf::default();
        let proxy = Arc::new(ServiceProxy::with_output(
            FakeCompose::default(),
            Box::new(buf.clone()),
        ));
        let (_trigger, shutdown) = shutdown_channel();

        run_walkthrough(
            Arc::clone(&proxy),
            &project(),
            WalkthroughOptions {
                pull: true,
                events: false,
            },
            shutdown,
        )
        .await
        .unwrap();

        assert_eq!(
            proxy.api().calls(),
            vec![
                "list", "pull", "create", "list", "start", "list", "stop", "list", "remove",
                "list",
            ]
        );
        let out = buf.contents();
        assert!(out.contains("Creating project: wp\n"));
        assert!(out.contains("Removing project: wp\n"));
    }

    #[tokio::test]
    async fn walkthrough_stops_at_first_failure() {
        let fake = FakeCompose {
            fail_on: Some("start"),
            ..Default::default()
        };
        let proxy = Arc::new(ServiceProxy::with_output(fake, Box::new(SharedBuf::default())));
        let (_trigger, shutdown) = shutdown_channel();

        let err = run_walkthrough(
            Arc::clone(&proxy),
            &project(),
            WalkthroughOptions {
                pull: false,
                events: true,
            },
            shutdown,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "start failed");
        let calls = proxy.api().calls();
        assert!(!calls.contains(&"stop".to_string()));
        assert_eq!(calls.iter().filter(|c| *c == "start").count(), 1);
    }
}
