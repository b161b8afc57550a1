use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xhrpool::{Client, Method, Payload, RequestOptions};

#[derive(Parser)]
#[command(name = "xhrpool")]
#[command(about = "Send a pooled request and print its classified outcome")]
#[command(version)]
struct Cli {
    /// HTTP method to use
    #[arg(value_name = "METHOD", ignore_case = true)]
    method: MethodArg,

    /// URL to request
    #[arg(value_name = "URL")]
    url: String,

    /// Request headers (format: "Name: Value")
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request params (format: "key=value"), sent as query or form body
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,

    /// Request body
    #[arg(short, long)]
    body: Option<String>,

    /// Mime type of the request, also used to parse the response
    #[arg(short = 't', long = "type", default_value = xhrpool::request::TYPE_JSON)]
    mime_type: String,

    /// Username for HTTP authentication
    #[arg(short, long)]
    user: Option<String>,

    /// Password for HTTP authentication
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Show response headers
    #[arg(long)]
    show_headers: bool,

    /// Log pool and transport activity
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum MethodArg {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl From<MethodArg> for Method {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::Get => Method::GET,
            MethodArg::Post => Method::POST,
            MethodArg::Put => Method::PUT,
            MethodArg::Delete => Method::DELETE,
            MethodArg::Head => Method::HEAD,
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "xhrpool=debug" } else { "xhrpool=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_options(cli: &Cli) -> anyhow::Result<RequestOptions> {
    let mut options = RequestOptions::new()
        .url(cli.url.as_str())
        .mime_type(cli.mime_type.as_str());

    for header in &cli.headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("invalid header {:?}, expected \"Name: Value\"", header);
        };
        options = options.header(name.trim(), value.trim())?;
    }

    for param in &cli.params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("invalid param {:?}, expected \"key=value\"", param);
        };
        options = options.param(key, value);
    }

    if let Some(body) = &cli.body {
        options = options.body(body.as_str());
    }

    if let Some(user) = &cli.user {
        options = options.credentials(user.as_str(), cli.password.as_deref().unwrap_or(""));
    }

    Ok(options)
}

fn print_payload(payload: &Payload) -> anyhow::Result<()> {
    match payload {
        Payload::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        other => println!("{}", other),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let client = Client::builder()
        .timeout(Duration::from_secs(cli.timeout))
        .build()
        .context("failed to build client")?;

    let options = build_options(&cli)?;
    let promise = client
        .request(cli.method.into(), options)
        .await
        .with_context(|| format!("failed to send request to {}", cli.url))?;
    let transport = promise.promiser();
    let outcome = promise.outcome().await;

    if cli.show_headers {
        if let Some(transport) = &transport {
            let status = transport.status().unwrap_or_default();
            println!("{} {}", "Status:".bold(), status);
            print!("{}", transport.get_all_response_headers()?);
            println!();
        }
    }

    match outcome {
        Ok(payload) => {
            print_payload(&payload)?;
            Ok(())
        }
        Err(error) => {
            eprintln!("{} {}", format!("{}:", error.kind()).red().bold(), error.message());
            if let Some(status) = error.status() {
                eprintln!("{} {}", "status".dimmed(), status);
            }
            if let Some(messages) = error.validation_messages() {
                eprintln!("{}", serde_json::to_string_pretty(messages)?.yellow());
            }
            std::process::exit(1);
        }
    }
}
