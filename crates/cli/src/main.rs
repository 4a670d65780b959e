use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use patchwork_core::{BatchError, Operation, OperationSpec};
use patchwork_engine::{JqCommand, ObjectPatcher, PatcherConfig};
use patchwork_kubehub::KubeStore;
use patchwork_spec::{parse_specs, ValidationErrors};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "patchworkctl", version, about = "Validate and apply batches of Kubernetes object operations")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for targets that do not name one (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Cascade { Foreground, Background, Orphan }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse, validate and execute a stream of operation specs
    Apply {
        /// Spec file (JSON stream or multi-document YAML); "-" reads stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Execute the valid specs even if some documents are invalid
        #[arg(long = "allow-invalid", action = ArgAction::SetTrue)]
        allow_invalid: bool,
    },
    /// Report every validation issue in a spec stream without executing it
    Validate {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Create the objects in a file; fails if one already exists
    Create {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long)]
        subresource: Option<String>,
    },
    /// Create the objects in a file, replacing existing ones
    Upsert {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long)]
        subresource: Option<String>,
    },
    /// Delete one object; a missing object is not an error
    Delete {
        /// e.g. "v1" or "apps/v1"
        api_version: String,
        kind: String,
        name: String,
        #[arg(long, value_enum, default_value_t = Cascade::Foreground)]
        cascade: Cascade,
        #[arg(long)]
        subresource: Option<String>,
    },
    /// Apply an RFC 7386 merge patch
    MergePatch {
        api_version: String,
        kind: String,
        name: String,
        /// Patch document as JSON
        #[arg(long)]
        patch: String,
        #[arg(long)]
        subresource: Option<String>,
    },
    /// Apply an RFC 6902 JSON patch
    JsonPatch {
        api_version: String,
        kind: String,
        name: String,
        /// Operation list as JSON
        #[arg(long)]
        patch: String,
        #[arg(long)]
        subresource: Option<String>,
    },
    /// Rewrite an object with a jq program
    JqPatch {
        api_version: String,
        kind: String,
        name: String,
        #[arg(long)]
        filter: String,
        #[arg(long)]
        subresource: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("PATCHWORK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PATCHWORK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PATCHWORK_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading specs from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("reading {}", path))
}

async fn build_patcher() -> Result<ObjectPatcher> {
    let store = KubeStore::try_default().await.context("connecting to the cluster")?;
    Ok(ObjectPatcher::new(Arc::new(store), Arc::new(JqCommand::from_env())).with_config(PatcherConfig::from_env()))
}

/// Fill the namespace of specs and embedded objects that leave it empty.
fn default_namespace(specs: &mut [OperationSpec], ns: &str) {
    for spec in specs {
        match &mut spec.operation {
            Operation::Create { object } | Operation::CreateOrUpdate { object } => default_object_namespace(object, ns),
            _ => {
                if spec.namespace.is_empty() {
                    spec.namespace = ns.to_string();
                }
            }
        }
    }
}

fn default_object_namespace(object: &mut Json, ns: &str) {
    let Some(meta) = object.get_mut("metadata").and_then(Json::as_object_mut) else { return };
    let empty = meta.get("namespace").and_then(Json::as_str).map_or(true, str::is_empty);
    if empty {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

#[derive(Serialize)]
struct FailureRow {
    index: usize,
    operation: String,
    error: String,
}

#[derive(Serialize)]
struct ApplyReport {
    total: usize,
    succeeded: usize,
    failed: Vec<FailureRow>,
}

fn report_batch(output: Output, total: usize, result: &Result<(), BatchError>) -> Result<()> {
    let failed: Vec<FailureRow> = match result {
        Ok(()) => Vec::new(),
        Err(e) => e
            .failures()
            .iter()
            .map(|f| FailureRow { index: f.index, operation: f.kind.to_string(), error: f.error.to_string() })
            .collect(),
    };
    match output {
        Output::Human => {
            println!("{} of {} operations succeeded", total - failed.len(), total);
            for row in &failed {
                println!("  #{:<4} {:<20} {}", row.index, row.operation, row.error);
            }
        }
        Output::Json => {
            let report = ApplyReport { total, succeeded: total - failed.len(), failed };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn report_issues(output: Output, errors: &ValidationErrors) -> Result<()> {
    match output {
        Output::Human => {
            for issue in &errors.issues {
                println!("{}", issue);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&errors.issues)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.clone().unwrap_or_default();
    let upsert = matches!(cli.command, Commands::Upsert { .. });

    match cli.command {
        Commands::Apply { file, allow_invalid } => {
            let bytes = read_input(&file)?;
            let parsed = parse_specs(&bytes)?;
            if let Some(errors) = parsed.error() {
                report_issues(cli.output, errors)?;
                if !allow_invalid {
                    bail!("{} invalid document(s); nothing applied", errors.documents().len());
                }
                warn!(invalid = errors.documents().len(), valid = parsed.specs.len(), "skipping invalid documents");
            }
            let mut specs = parsed.specs;
            if !ns.is_empty() {
                default_namespace(&mut specs, &ns);
            }
            info!(specs = specs.len(), file = %file, "apply invoked");
            let patcher = build_patcher().await?;
            let result = patcher.execute_batch(&specs).await;
            report_batch(cli.output, specs.len(), &result)?;
            if let Err(e) = result {
                bail!("{} of {} operations failed", e.len(), specs.len());
            }
        }
        Commands::Validate { file } => {
            let bytes = read_input(&file)?;
            let parsed = parse_specs(&bytes)?;
            match parsed.error() {
                Some(errors) => {
                    report_issues(cli.output, errors)?;
                    bail!("{} invalid document(s)", errors.documents().len());
                }
                None => match cli.output {
                    Output::Human => println!("{} spec(s) valid", parsed.specs.len()),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&parsed.specs)?),
                },
            }
        }
        Commands::Create { file, subresource } | Commands::Upsert { file, subresource } => {
            let bytes = read_input(&file)?;
            let docs = patchwork_spec::decode_documents(&bytes)?;
            let patcher = build_patcher().await?;
            let mut failed = 0usize;
            for (index, mut object) in docs.into_iter().enumerate() {
                if !ns.is_empty() {
                    default_object_namespace(&mut object, &ns);
                }
                let res = if upsert {
                    patcher.create_or_update_object(&object, subresource.as_deref()).await
                } else {
                    patcher.create_object(&object, subresource.as_deref()).await
                };
                if let Err(e) = res {
                    failed += 1;
                    eprintln!("object #{}: {}", index, e);
                }
            }
            if failed > 0 {
                bail!("{} object(s) failed", failed);
            }
        }
        Commands::Delete { api_version, kind, name, cascade, subresource } => {
            let patcher = build_patcher().await?;
            let sub = subresource.as_deref();
            match cascade {
                Cascade::Foreground => patcher.delete_object(&api_version, &kind, &ns, &name, sub).await?,
                Cascade::Background => patcher.delete_object_in_background(&api_version, &kind, &ns, &name, sub).await?,
                Cascade::Orphan => patcher.delete_object_non_cascading(&api_version, &kind, &ns, &name, sub).await?,
            }
            info!(kind = %kind, name = %name, cascade = ?cascade, "deleted");
        }
        Commands::MergePatch { api_version, kind, name, patch, subresource } => {
            let patcher = build_patcher().await?;
            patcher
                .merge_patch_object(patch.as_bytes(), &api_version, &kind, &ns, &name, subresource.as_deref())
                .await?;
        }
        Commands::JsonPatch { api_version, kind, name, patch, subresource } => {
            let patcher = build_patcher().await?;
            patcher
                .json_patch_object(patch.as_bytes(), &api_version, &kind, &ns, &name, subresource.as_deref())
                .await?;
        }
        Commands::JqPatch { api_version, kind, name, filter, subresource } => {
            let patcher = build_patcher().await?;
            patcher
                .jq_patch_object(&filter, &api_version, &kind, &ns, &name, subresource.as_deref())
                .await?;
        }
    }
    Ok(())
}
