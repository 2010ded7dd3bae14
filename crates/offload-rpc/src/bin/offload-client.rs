//! Offload client - runs a built-in kernel through an offload decision site.
//!
//! Sends a module holding the chosen kernel, runs it `--runs` times through
//! a decision site and checks every result against the local body.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use offload_core::{
    exit_on_fatal, kernels, Arg, ClientTransport, CommType, OffloadClient, OffloadDecisionSite,
    OffloadError, Scalar, ShmemClientTransport, ShmemConfig, StreamClientTransport, StreamConfig,
    TimeMeasure, TimeMeasureLog,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kernel {
    Add,
    Scale,
    Matmul,
    #[value(name = "jacobi_2d")]
    Jacobi2d,
    Seidel,
}

impl Kernel {
    fn name(&self) -> &'static str {
        match self {
            Kernel::Add => "add",
            Kernel::Scale => "scale",
            Kernel::Matmul => "matmul",
            Kernel::Jacobi2d => "jacobi_2d",
            Kernel::Seidel => "seidel",
        }
    }

    fn token(&self) -> &'static str {
        match self {
            Kernel::Add => kernels::ADD,
            Kernel::Scale => kernels::SCALE,
            Kernel::Matmul => kernels::MATMUL,
            Kernel::Jacobi2d => kernels::JACOBI_2D,
            Kernel::Seidel => kernels::SEIDEL,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "offload-client")]
#[command(about = "Run a built-in kernel on an offload server")]
struct Args {
    /// Communication mechanism: socket or sharedmem
    #[arg(long, default_value = "socket", value_parser = parse_comm)]
    comm: CommType,

    /// Server host
    #[arg(long, default_value = StreamConfig::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = StreamConfig::DEFAULT_PORT)]
    port: u16,

    /// Base name of the shared memory objects
    #[arg(long, default_value = ShmemConfig::REGION_NAME)]
    shmem_name: String,

    /// Kernel to run
    #[arg(short, long, value_enum, default_value = "add")]
    kernel: Kernel,

    /// Problem size: elements for scale, matrix side for the others
    #[arg(short = 'n', long, default_value_t = 8)]
    size: usize,

    /// Number of calls
    #[arg(short, long, default_value_t = 1)]
    runs: usize,

    /// Profitability score of the call site (default: always offload)
    #[arg(long, default_value_t = u64::MAX)]
    threshold: u64,

    /// Append time measures to this file as JSON lines
    #[arg(long)]
    time_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_comm(s: &str) -> std::result::Result<CommType, String> {
    CommType::from_str(s).ok_or_else(|| format!("unknown communication type '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if let Err(e) = run(&args).await {
        exit_on_fatal(&e);
    }
    Ok(())
}

async fn run(args: &Args) -> offload_core::Result<()> {
    let start = Instant::now();
    match args.comm {
        CommType::Socket => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port)
                .parse()
                .map_err(|e| OffloadError::Config {
                    message: format!("invalid server address: {}", e),
                })?;
            let transport = StreamClientTransport::connect(addr).await?;
            drive(OffloadClient::new(transport), args, start).await
        }
        CommType::SharedMem => {
            let config = ShmemConfig::with_base(&args.shmem_name, 0);
            let transport = ShmemClientTransport::open(&config)?;
            drive(OffloadClient::new(transport), args, start).await
        }
    }
}

async fn drive<T: ClientTransport>(
    mut client: OffloadClient<T>,
    args: &Args,
    start: Instant,
) -> offload_core::Result<()> {
    let kernel = args.kernel;
    let table = kernels::builtin_table()?;
    let module_text = table.module_text("kernels", &[kernel.name()])?;

    let ready = client.initialise(&module_text).await?;
    let setup_micros = start.elapsed().as_micros().min(i64::MAX as u128) as i64;

    let mut log = match &args.time_file {
        Some(path) => Some(TimeMeasureLog::open(path)?),
        None => None,
    };
    if let Some(log) = log.as_mut() {
        log.record(&TimeMeasure::session("kernels", setup_micros, ready))?;
    }

    let site = OffloadDecisionSite::new(kernel.token(), args.threshold)?;

    for run in 0..args.runs {
        let (a, b) = (run as i32, args.size as i32);
        let mut buffers = inputs(kernel, args.size);

        let mut expected = buffers.clone();
        let expected_value = {
            let mut local_args = build_args(kernel, &mut expected, a, b);
            local_body(kernel, &mut local_args)
        };

        let mut call_args = build_args(kernel, &mut buffers, a, b);
        let bytes = site.argument_bytes(&call_args)?;
        let outcome = site
            .run(&mut client, &mut call_args, |args| local_body(kernel, args))
            .await?;
        drop(call_args);

        if outcome.value.map(|v| v.to_bits()) != expected_value.map(|v| v.to_bits())
            || buffers != expected
        {
            return Err(OffloadError::Other(format!(
                "{} result of run {} differs from the local body",
                kernel.name(),
                run
            )));
        }
        debug!("Run {} of {} verified ({})", run, kernel.name(), outcome.path);

        if let Some(log) = log.as_mut() {
            log.record(&TimeMeasure::Call {
                function: kernel.name().to_string(),
                path: outcome.path.to_string(),
                score: site.score(),
                bytes,
                exec_micros: outcome.exec_micros,
                call_micros: outcome.call_micros,
            })?;
        }
    }

    if let Some(mut log) = log {
        log.flush()?;
    }
    info!(
        "{} verified over {} runs ({} remote calls)",
        kernel.name(),
        args.runs,
        client.calls_made()
    );
    client.close().await
}

/// Array inputs of one run; empty for `add`.
fn inputs(kernel: Kernel, size: usize) -> Vec<Vec<f64>> {
    let elements = size * size;
    match kernel {
        Kernel::Add => Vec::new(),
        Kernel::Scale => vec![(0..size).map(|i| i as f64).collect()],
        Kernel::Matmul => vec![
            (0..elements).map(|i| (i % 13) as f64 * 0.25).collect(),
            (0..elements).map(|i| ((i * 7) % 11) as f64 - 5.0).collect(),
            vec![0.0; elements],
        ],
        Kernel::Jacobi2d | Kernel::Seidel => vec![kernels::stencil_input(size)],
    }
}

/// Call-site arguments: each array is followed by its element count.
fn build_args(kernel: Kernel, buffers: &mut [Vec<f64>], a: i32, b: i32) -> Vec<Arg<'_>> {
    if kernel == Kernel::Add {
        return vec![Arg::scalar(a), Arg::scalar(b)];
    }
    let mut args = Vec::with_capacity(buffers.len() * 2);
    for buffer in buffers.iter_mut() {
        let count = buffer.len();
        args.push(Arg::array(buffer));
        args.push(Arg::count(count));
    }
    args
}

fn doubles(args: &mut [Arg<'_>], index: usize) -> Vec<f64> {
    args.get_mut(index)
        .and_then(Arg::as_f64_mut)
        .map(|s| s.to_vec())
        .unwrap_or_default()
}

/// The original, local body of each kernel.
fn local_body(kernel: Kernel, args: &mut [Arg<'_>]) -> Option<Scalar> {
    match kernel {
        Kernel::Add => {
            let a = args.first().and_then(Arg::as_i64).unwrap_or(0) as i32;
            let b = args.get(1).and_then(Arg::as_i64).unwrap_or(0) as i32;
            return Some(Scalar::i32(kernels::add(a, b)));
        }
        Kernel::Scale => {
            if let Some(data) = args.first_mut().and_then(Arg::as_f64_mut) {
                kernels::scale(data);
            }
        }
        Kernel::Matmul => {
            let a = doubles(args, 0);
            let b = doubles(args, 2);
            let n = kernels::square_side(a.len()).unwrap_or(0);
            if let Some(c) = args.get_mut(4).and_then(Arg::as_f64_mut) {
                kernels::matmul(&a, &b, c, n);
            }
        }
        Kernel::Jacobi2d | Kernel::Seidel => {
            if let Some(data) = args.first_mut().and_then(Arg::as_f64_mut) {
                if let Some(n) = kernels::square_side(data.len()) {
                    if kernel == Kernel::Jacobi2d {
                        kernels::jacobi_2d(data, n, kernels::STENCIL_STEPS);
                    } else {
                        kernels::seidel(data, n, kernels::STENCIL_STEPS);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_add_returns_sum() {
        let mut buffers = inputs(Kernel::Add, 4);
        let mut args = build_args(Kernel::Add, &mut buffers, 3, 4);
        assert_eq!(local_body(Kernel::Add, &mut args), Some(Scalar::i32(7)));
    }

    #[test]
    fn test_local_array_kernels_return_nothing() {
        let mut buffers = inputs(Kernel::Scale, 3);
        let mut args = build_args(Kernel::Scale, &mut buffers, 0, 3);
        assert_eq!(local_body(Kernel::Scale, &mut args), None);
        drop(args);
        assert_eq!(buffers[0], vec![0.0, 2.0, 4.0]);
    }
}
