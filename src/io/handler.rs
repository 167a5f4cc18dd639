use std::io::Write;

use eyre::Result;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ProgressEvent, Shutdown};

/// Drains the progress channel into a writer, one line per event.
pub struct ProgressHandler<W: Write> {
    out: W,
}

impl<W: Write> ProgressHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn handle_progress_event(&mut self, event: &ProgressEvent) -> Result<()> {
        writeln!(self.out, "{}", event)?;
        self.out.flush()?;
        Ok(())
    }

    /// Runs until the shutdown fires or every writer is dropped, then
    /// hands the writer back.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProgressEvent>,
        mut shutdown: Shutdown,
    ) -> W {
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("Progress handler cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_progress_event(&event) {
                            error!("Oops, something wrong happen: {:?}", err);
                        }
                    }
                    None => break,
                },
            }
        }
        self.out
    }
}

impl ProgressHandler<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

/// Background task slot that replaces whatever ran there before.
#[derive(Default)]
pub struct TaskSlot {
    active_task: Option<JoinHandle<()>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self { active_task: None }
    }

    pub async fn replace(&mut self, task: JoinHandle<()>) {
        self.abort_current_task().await;
        self.active_task = Some(task);
    }

    pub async fn abort_current_task(&mut self) {
        if let Some(task) = self.active_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{shutdown_channel, ProgressWriter};

    #[tokio::test]
    async fn drains_until_writers_are_dropped() {
        let (writer, rx) = ProgressWriter::new(4);
        let (_trigger, shutdown) = shutdown_channel();
        let handler = ProgressHandler::new(Vec::new());
        let task = tokio::spawn(handler.run(rx, shutdown));

        writer.resource("Network", "wp_default", "Created").await;
        writer
            .send(ProgressEvent::Message("done".to_string()))
            .await;
        drop(writer);

        let out = String::from_utf8(task.await.unwrap()).unwrap();
        assert_eq!(out, "Network wp_default  Created\ndone\n");
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_writer, rx) = ProgressWriter::new(4);
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(ProgressHandler::new(Vec::new()).run(rx, shutdown));
        trigger.trigger();
        assert!(task.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_slot_aborts_previous_task() {
        let mut slot = TaskSlot::new();
        slot.replace(tokio::spawn(futures::future::pending::<()>()))
            .await;
        assert!(slot.is_active());
        slot.abort_current_task().await;
        assert!(!slot.is_active());
    }
}
