use std::sync::Arc;

use bcompose::compose::{DockerCompose, ListOptions, ServiceProxy};
use bcompose::config::{self, Cli, Command, Format};
use bcompose::io::handler::ProgressHandler;
use bcompose::io::{shutdown_channel, ProgressWriter, Shutdown};
use bcompose::project::{load_project, Project};
use bcompose::{logging, run_walkthrough, WalkthroughOptions};
use clap::Parser;
use eyre::{Result, WrapErr};
use log::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = cli.log_file_path();
    logging::init(cli.log_level(), log_file.as_deref())?;
    debug!("Started with {:?}", cli);

    let (trigger, shutdown) = shutdown_channel();
    let trigger = Arc::new(trigger);
    {
        let trigger = Arc::clone(&trigger);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                trigger.trigger();
            }
        });
    }

    let (progress, progress_rx) = ProgressWriter::new(100);
    let printer = tokio::spawn(ProgressHandler::stdout().run(progress_rx, shutdown.clone()));

    let api = DockerCompose::connect_with_local_defaults(progress)?;
    let proxy = Arc::new(ServiceProxy::new(api));

    let result = dispatch(&cli, Arc::clone(&proxy), shutdown).await;

    // Every writer must be gone for the printer to see the end of the channel.
    drop(proxy);
    let _ = printer.await;
    trigger.trigger();
    result
}

async fn dispatch(
    cli: &Cli,
    proxy: Arc<ServiceProxy<DockerCompose>>,
    shutdown: Shutdown,
) -> Result<()> {
    let default = Command::default();
    let command = cli.command.as_ref().unwrap_or(&default);

    match command {
        Command::Ls { all, format } => {
            let stacks = proxy.stacks(ListOptions { all: *all }).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&stacks)?),
                Format::Table => {
                    println!("{:<24} {:<32} {}", "NAME", "STATUS", "CONFIG FILES");
                    for stack in stacks {
                        println!("{:<24} {:<32} {}", stack.name, stack.status, stack.config_files);
                    }
                }
            }
        }
        Command::Create(args) => {
            let project = project(cli)?;
            proxy.create(&project, args.options()).await?;
        }
        Command::Pull {
            ignore_pull_failures,
            quiet,
        } => {
            let project = project(cli)?;
            proxy
                .pull(&project, config::pull_options(*ignore_pull_failures, *quiet))
                .await?;
        }
        Command::Start {
            no_wait,
            wait_timeout,
        } => {
            let project = project(cli)?;
            proxy
                .start(&project, config::start_options(*no_wait, *wait_timeout))
                .await?;
        }
        Command::Stop { timeout } => {
            let project = project(cli)?;
            proxy.stop(&project, config::stop_options(*timeout)).await?;
        }
        Command::Rm { volumes } => {
            let project = project(cli)?;
            proxy.remove(&project, config::remove_options(*volumes)).await?;
        }
        Command::Events { json } => {
            let project = project(cli)?;
            proxy.event(&project.name, *json, shutdown).await?;
        }
        Command::Config => {
            let project = project(cli)?;
            print!("{}", serde_yaml::to_string(&project)?);
        }
        Command::Walkthrough(args) => {
            let project = project(cli)?;
            let options = WalkthroughOptions {
                pull: args.pull,
                events: !args.no_events,
            };
            run_walkthrough(proxy, &project, options, shutdown).await?;
        }
    }
    Ok(())
}

fn project(cli: &Cli) -> Result<Project> {
    load_project(&cli.project_options()).wrap_err("cannot load compose project")
}
