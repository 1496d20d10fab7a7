use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dsrelay::config::ServiceConfig;
use dsrelay::defaults::split_array_literal;
use dsrelay::engine::{Engine, RequestContext, UserContext};
use dsrelay::param::{ParamMap, ParamValue};
use dsrelay::projection::{JsonOutput, OutputSink, XmlOutput};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Serve declarative SQL data services from the command line
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Service descriptor (defaults to <config dir>/dsrelay/service.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one operation
    Run {
        operation: String,
        /// Scalar parameter, `name=value`
        #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Array parameter, `name=a,b,c`
        #[arg(short = 'a', long = "array", value_name = "NAME=LIST")]
        arrays: Vec<String>,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Run one operation per parameter set as a single batch
    Batch {
        operation: String,
        /// JSON array of parameter objects
        #[arg(long)]
        params_file: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Run several operations in one transaction
    Boxcar {
        /// JSON array of `{"operation": ..., "params": {...}}`
        #[arg(long)]
        requests_file: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// List the operations the service offers
    List,
}

#[derive(clap::Args)]
struct RequestArgs {
    #[arg(long, value_enum, default_value_t = Format::Xml)]
    format: Format,
    /// Run as this user
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    tenant: Option<String>,
    /// Role held by the user; repeatable
    #[arg(long = "role")]
    roles: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Xml,
    Json,
}

#[derive(Deserialize)]
struct BoxcarRequest {
    operation: String,
    #[serde(default)]
    params: serde_json::Map<String, serde_json::Value>,
}

impl RequestArgs {
    fn context(&self) -> RequestContext {
        let mut user = match &self.user {
            Some(name) => UserContext::new(name.clone()),
            None => UserContext::anonymous(),
        };
        if let Some(tenant) = &self.tenant {
            user = user.with_tenant(tenant.clone());
        }
        RequestContext::new(user.with_roles(self.roles.iter().cloned()))
    }

    fn sink(&self) -> Box<dyn OutputSink> {
        match self.format {
            Format::Xml => Box::new(XmlOutput::pretty(io::stdout())),
            Format::Json => Box::new(JsonOutput::new(io::stdout())),
        }
    }
}

fn split_assignment(arg: &str) -> Result<(&str, &str)> {
    arg.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got {:?}", arg))
}

fn cli_params(params: &[String], arrays: &[String]) -> Result<ParamMap> {
    let mut map = ParamMap::new();
    for arg in params {
        let (name, value) = split_assignment(arg)?;
        map.insert(name, value);
    }
    for arg in arrays {
        let (name, list) = split_assignment(arg)?;
        let items = split_array_literal(list)
            .map_err(|e| anyhow!("array parameter '{}': {}", name, e))?;
        map.insert(name, ParamValue::array(items));
    }
    Ok(map)
}

fn json_value(value: &serde_json::Value) -> ParamValue {
    match value {
        serde_json::Value::Null => ParamValue::Null,
        serde_json::Value::String(s) => ParamValue::Scalar(s.clone()),
        serde_json::Value::Array(items) => ParamValue::Array(items.iter().map(json_value).collect()),
        other => ParamValue::Scalar(other.to_string()),
    }
}

fn json_params(object: &serde_json::Map<String, serde_json::Value>) -> ParamMap {
    object
        .iter()
        .map(|(name, value)| (name.as_str(), json_value(value)))
        .collect()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn finish(mut out: Box<dyn OutputSink>) -> Result<()> {
    out.finish()?;
    println!();
    io::stdout().flush()?;
    Ok(())
}

async fn run_boxcar(engine: &Engine, requests: Vec<BoxcarRequest>, args: &RequestArgs) -> Result<()> {
    let mut ctx = args.context();
    engine.begin_boxcar(&mut ctx);
    for request in &requests {
        let mut out = args.sink();
        let result = engine
            .execute(&mut ctx, &request.operation, json_params(&request.params), out.as_mut())
            .await;
        if let Err(err) = result {
            if let Err(cleanup) = engine.abort_boxcar(&mut ctx).await {
                tracing::warn!(error = %cleanup, "boxcar rollback failed");
            }
            return Err(err.into());
        }
        finish(out)?;
    }
    engine.close_boxcar(&mut ctx).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let path = cli.config.unwrap_or_else(ServiceConfig::default_path);
    let service = ServiceConfig::load(&path)?;
    let engine = service.build_engine()?;

    match cli.command {
        Command::List => {
            for op in engine.operations() {
                match &op.description {
                    Some(desc) => println!("{:<24} {} ({})", op.name, desc, op.query_id()),
                    None => println!("{:<24} ({})", op.name, op.query_id()),
                }
            }
        }
        Command::Run {
            operation,
            params,
            arrays,
            request,
        } => {
            let params = cli_params(&params, &arrays)?;
            let mut ctx = request.context();
            let mut out = request.sink();
            engine
                .execute(&mut ctx, &operation, params, out.as_mut())
                .await?;
            finish(out)?;
        }
        Command::Batch {
            operation,
            params_file,
            request,
        } => {
            let items: Vec<serde_json::Map<String, serde_json::Value>> = read_json(&params_file)?;
            if items.is_empty() {
                bail!("{} holds no parameter sets", params_file.display());
            }
            let items = items.iter().map(json_params).collect();
            let mut ctx = request.context();
            let mut out = request.sink();
            engine
                .execute_batch(&mut ctx, &operation, items, out.as_mut())
                .await?;
            finish(out)?;
        }
        Command::Boxcar {
            requests_file,
            request,
        } => {
            let requests: Vec<BoxcarRequest> = read_json(&requests_file)?;
            run_boxcar(&engine, requests, &request).await?;
        }
    }

    Ok(())
}
