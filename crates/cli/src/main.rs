//! `aiko-pipeline`: create or tear down a pipeline from the command line.
//!
//! Connects the transport, loads a pipeline definition, builds and runs
//! it for at most one frame, and (best-effort) registers with whichever
//! registrar currently holds primary. Concrete media `PipelineElement`s
//! are out of scope for this workspace, so a definition whose elements
//! are all `deploy: remote` is the only kind this binary can usefully
//! drive end to end; a `local` element with no matching factory is a
//! configuration error, same as it would be for any other process.

mod definition;
mod registrar_client;

use aiko_core::element::{FrameContext, LocalElementRegistry};
use aiko_core::event_loop::EventLoop;
use aiko_core::pipeline::{FrameOutcome, Pipeline};
use aiko_core::service::{Service, TopicPath};
use aiko_core::{init_tracing, Config};
use aiko_transport::MqttTransport;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

const REGISTRAR_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STREAM_GRACE_TIME: Duration = Duration::from_secs(60);
/// Fixed service-id convention for pipelines this binary launches: one
/// CLI invocation manages exactly one service within its host process.
const CLI_SERVICE_ID: u32 = 1;

#[derive(Parser)]
#[command(name = "aiko-pipeline")]
#[command(author, version)]
#[command(about = "Create or delete an Aiko Services pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a pipeline from a definition file and optionally run one frame.
    Create {
        definition_path: PathBuf,

        /// Service name; defaults to the definition's own `name`.
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        stream_id: Option<u64>,

        #[arg(long)]
        frame_id: Option<u64>,

        /// A JSON object used as the initial swag for one `process_frame` call.
        #[arg(long)]
        frame_data: Option<String>,
    },
    /// Look up a registered service by name and remove it from the registrar.
    Delete { name: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config);

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let owner = std::env::var("USER").unwrap_or_else(|_| "aiko-pipeline".to_string());
    let process_id = std::process::id();
    let topic_path = TopicPath::new(config.namespace.clone(), hostname, process_id, CLI_SERVICE_ID);

    match cli.command {
        Command::Create {
            definition_path,
            name,
            stream_id,
            frame_id,
            frame_data,
        } => create(&config, topic_path, owner, definition_path, name, stream_id, frame_id, frame_data).await,
        Command::Delete { name } => delete(&config, &name).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn create(
    config: &Config,
    topic_path: TopicPath,
    owner: String,
    definition_path: PathBuf,
    name: Option<String>,
    stream_id: Option<u64>,
    frame_id: Option<u64>,
    frame_data: Option<String>,
) -> Result<()> {
    let definition = definition::load(&definition_path).context("loading pipeline definition")?;
    let service_name = name.unwrap_or_else(|| definition.name.clone());
    let transport_kind = format!("{:?}", config.transport).to_lowercase();
    let service = Service::new(topic_path.clone(), service_name, "pipeline", transport_kind, owner);

    // No concrete media elements are registered here; see the module
    // doc comment. A definition naming only remote elements still runs
    // end to end.
    let registry = LocalElementRegistry::new();
    let mut pipeline = Pipeline::from_definition(&definition, &registry, service).context("building pipeline")?;

    let client_id = format!("aiko-pipeline-{topic_path}-{}", uuid::Uuid::new_v4());
    let state_topic = topic_path.state_topic();
    let (transport, mut queue_rx) = MqttTransport::connect(config, &client_id, Some((state_topic.as_str(), "(absent)", true)))
        .await
        .context("connecting to broker")?;

    let registrar = match registrar_client::discover_primary(
        &transport,
        &mut queue_rx,
        &config.namespace,
        REGISTRAR_DISCOVERY_TIMEOUT,
    )
    .await
    {
        Ok(registrar) => {
            let record = pipeline.service.to_record(now_epoch_secs());
            registrar_client::register(&transport, &registrar, &record)
                .await
                .context("registering with registrar")?;
            transport
                .publish(&topic_path.state_topic(), "(ready)", true, true)
                .await
                .ok();
            Some(registrar)
        }
        Err(err) => {
            warn!(%err, "no registrar found; continuing unregistered");
            None
        }
    };

    let mut event_loop = EventLoop::new();

    if let Some(stream_id) = stream_id {
        pipeline
            .create_stream(&mut event_loop, stream_id, Default::default(), DEFAULT_STREAM_GRACE_TIME)
            .context("creating stream")?;
    }

    if let Some(frame_data) = frame_data {
        let swag = definition::swag_from_json(&frame_data).context("parsing --frame-data")?;
        let mut context = FrameContext::new(stream_id.unwrap_or(0), frame_id.unwrap_or(0));
        context.swag = swag;
        match pipeline.process_frame(&mut event_loop, context).context("processing frame")? {
            FrameOutcome::Completed(swag) => {
                let mut ordered: Vec<(&String, &aiko_core::element::Value)> = swag.iter().collect();
                ordered.sort_by_key(|(key, _)| key.to_string());
                let object: serde_json::Map<String, serde_json::Value> = ordered
                    .into_iter()
                    .map(|(key, value)| (key.clone(), definition::value_to_json(value)))
                    .collect();
                println!("{}", serde_json::Value::Object(object));
            }
            FrameOutcome::Dropped => info!("frame dropped"),
        }
    }

    transport.publish(&topic_path.state_topic(), "(stopped)", true, true).await.ok();
    if let Some(registrar) = registrar {
        registrar_client::unregister(&transport, &registrar, &topic_path).await.ok();
    }
    transport.shutdown();

    Ok(())
}

async fn delete(config: &Config, name: &str) -> Result<()> {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let client_id = format!("aiko-pipeline-delete-{hostname}-{}", uuid::Uuid::new_v4());
    let (transport, mut queue_rx) = MqttTransport::connect(config, &client_id, None)
        .await
        .context("connecting to broker")?;

    let registrar = registrar_client::discover_primary(&transport, &mut queue_rx, &config.namespace, REGISTRAR_DISCOVERY_TIMEOUT)
        .await
        .context("discovering primary registrar")?;

    let response_topic = format!("{}/service/registrar/delete/{}/{}", config.namespace, client_id, name);
    let matches = registrar_client::find_by_name(
        &transport,
        &mut queue_rx,
        &registrar,
        &response_topic,
        name,
        REGISTRAR_DISCOVERY_TIMEOUT,
    )
    .await
    .context("querying registrar")?;

    if matches.is_empty() {
        transport.shutdown();
        anyhow::bail!("no service named '{name}' is registered");
    }

    for topic_path in &matches {
        registrar_client::unregister(&transport, &registrar, topic_path)
            .await
            .with_context(|| format!("unregistering '{topic_path}'"))?;
        println!("removed {topic_path}");
    }

    transport.shutdown();
    Ok(())
}
