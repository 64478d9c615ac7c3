use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clap::Parser;
use libvoldriver::{
    BackoffPolicy, Context, DriverEnv, ExponentialBackoff, InvokeError, Invoker,
    ProcessGroupInvoker, RetryConfig, RetryError, logging,
};
use tracing::{error, info, info_span};

const EXIT_FAILED: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "voldriver-exec")]
#[command(about = "Run a helper in its own process group, killing the group on timeout or Ctrl-C", long_about = None)]
struct Cli {
    /// Give up and kill the command after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Retry failed runs with exponential backoff (see VOLDRIVER_RETRY_* variables).
    #[arg(long)]
    retry: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    #[arg(value_name = "PROGRAM")]
    program: String,

    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    logging::init_tracing(cli.json_logs).map_err(|e| anyhow!(e))?;

    let root = Context::background();
    let (ctx, canceller) = match cli.timeout {
        Some(secs) => Context::with_timeout(&root, Duration::from_secs(secs)),
        None => Context::with_cancel(&root),
    };
    let env = DriverEnv::new(info_span!("voldriver-exec"), ctx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            canceller.cancel();
        }
    });

    let invoker = ProcessGroupInvoker::new();
    let code = if cli.retry {
        let policy = BackoffPolicy::from(RetryConfig::from_env());
        let backoff = ExponentialBackoff::system(Some(env.clone())).with_policy(policy);
        let (invoker, program, args) = (&invoker, cli.program.as_str(), cli.args.as_slice());

        let result = backoff
            .retry(|env| async move { invoker.invoke(&env, program, args).await })
            .await;
        match result {
            Ok(output) => succeeded(&output)?,
            Err(RetryError::Cancelled(reason)) => {
                error!(%reason, "gave up retrying");
                EXIT_CANCELLED
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, "retry budget exhausted");
                failed(&last)?
            }
        }
    } else {
        match invoker.invoke(&env, &cli.program, &cli.args).await {
            Ok(output) => succeeded(&output)?,
            Err(err) => failed(&err)?,
        }
    };

    Ok(ExitCode::from(code))
}

fn succeeded(output: &[u8]) -> anyhow::Result<u8> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output)
        .and_then(|_| stdout.flush())
        .context("Failed to write command output")?;
    Ok(0)
}

fn failed(err: &InvokeError) -> anyhow::Result<u8> {
    {
        let mut stderr = std::io::stderr().lock();
        stderr
            .write_all(err.output())
            .and_then(|_| stderr.flush())
            .context("Failed to write command output")?;
    }
    error!(error = %err, "command did not succeed");
    Ok(match err.cancellation() {
        Some(_) => EXIT_CANCELLED,
        None => EXIT_FAILED,
    })
}
