use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use git_repository::Repository;
use git_server::{handle_info_refs, handle_receive_pack, handle_upload_pack, Service, ServerConfig};

/// Smart-HTTP git server: serves `info/refs`, `git-upload-pack`, and
/// `git-receive-pack` for a single bare repository.
#[derive(Parser)]
#[command(name = "gitr-server", about = "Smart-HTTP git server")]
struct Cli {
    /// Path to the bare repository to serve.
    #[arg(long)]
    repo: PathBuf,

    /// Log filter, e.g. "info" or "git_protocol=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the ref advertisement for a service, as if answering
    /// `GET info/refs?service=<service>`.
    InfoRefs { service: String },
    /// Read a upload-pack (fetch) request body from stdin and write the
    /// response to stdout.
    UploadPack,
    /// Read a receive-pack (push) request body from stdin and write the
    /// response to stdout.
    ReceivePack,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.clone()))
        .init();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            process::exit(128);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let repo = Repository::open(&cli.repo)
        .with_context(|| format!("opening repository at {}", cli.repo.display()))?;
    let config = ServerConfig::load(Some(repo.git_dir()))
        .context("loading server configuration")?;

    use std::io::{Read, Write};

    match cli.command {
        Command::InfoRefs { service } => {
            let service = Service::from_query_param(&service)
                .with_context(|| format!("unknown service: {service}"))?;
            let out = handle_info_refs(&repo, service)?;
            std::io::stdout().write_all(&out)?;
        }
        Command::UploadPack => {
            let mut body = Vec::new();
            std::io::stdin().read_to_end(&mut body)?;
            let out = handle_upload_pack(&repo, &body)?;
            std::io::stdout().write_all(&out)?;
        }
        Command::ReceivePack => {
            let mut body = Vec::new();
            std::io::stdin().read_to_end(&mut body)?;
            let out = handle_receive_pack(
                &repo,
                &body,
                &config.protected_refs,
                config.allow_non_fast_forward,
            )?;
            std::io::stdout().write_all(&out)?;
        }
    }

    Ok(0)
}
