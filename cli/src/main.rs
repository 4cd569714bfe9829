use std::{
    fs::File,
    io::{BufWriter, Read},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use core_cache::{
    config::{SingleLineConfig, WriteBackConfig},
    single_line::SingleLineCache,
    trace::{self, SingleLineOp, WriteBackOp},
    write_back::{RequestError, WriteBackCache},
};

#[cfg(feature = "stat")]
use core_cache::stat::{AddStats, Stats};
#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// replay store requests through the multi-port write-back cache
    WriteBack(CommonArgs),
    /// replay line reads and writes through the single-line write-through cache
    SingleLine(SingleLineArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// File path to cache configuration (json)
    #[arg(short, long)]
    config: PathBuf,
    /// File path to request trace
    #[arg(short, long)]
    trace: PathBuf,
    /// Size of main memory in words
    #[arg(long, default_value_t = 1 << 16)]
    memory_words: usize,
    /// File path to dump main memory to (json) after replay
    #[arg(long)]
    dump: Option<PathBuf>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct SingleLineArgs {
    #[command(flatten)]
    delegate: CommonArgs,
    /// Words per line (1, 2, 4, 8 or 16)
    #[arg(short, long, default_value_t = 4)]
    words_per_line: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::WriteBack(common) => {
            init_logger(common.verbose);
            let config = WriteBackConfig::deser(File::open(&common.config)?)?;
            let ops = trace::parse_write_back(&read_to_string(&common.trace)?)?;
            let mut mem = vec![0u32; common.memory_words];
            replay_write_back(config, ops, &mut mem)?;
            dump_memory(common.dump, &mem)
        }
        Command::SingleLine(SingleLineArgs {
            delegate: common,
            words_per_line,
        }) => {
            init_logger(common.verbose);
            let config = SingleLineConfig::deser(File::open(&common.config)?)?;
            let ops = trace::parse_single_line(&read_to_string(&common.trace)?)?;
            let mut mem = vec![0u32; common.memory_words];
            macro_rules! replay {
                ($($n:literal)*) => {
                    match words_per_line {
                        $($n => replay_single_line::<$n>(config, ops, &mut mem)?,)*
                        n => return Err(anyhow!("unsupported number of words per line: {n}")),
                    }
                };
            }
            replay!(1 2 4 8 16);
            dump_memory(common.dump, &mem)
        }
    }
}

fn init_logger(verbose: bool) {
    if verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::init();
    }
}

/// one producer thread per port submits that port's stores in trace order,
/// then closes the port. everything after the first `shutdown` is ignored.
fn replay_write_back(config: WriteBackConfig, ops: Vec<WriteBackOp>, mem: &mut [u32]) -> Result<()> {
    let mut per_port = vec![Vec::new(); config.n_ports];
    for (index, op) in ops.iter().enumerate() {
        match *op {
            WriteBackOp::Store { port, addr, value } => match per_port.get_mut(port) {
                Some(queue) => queue.push((addr, value)),
                None => {
                    return Err(RequestError::InvalidPort {
                        port,
                        n_ports: config.n_ports,
                    }
                    .into())
                }
            },
            WriteBackOp::Shutdown => {
                if index + 1 != ops.len() {
                    log::warn!("ignoring {} requests after shutdown", ops.len() - index - 1);
                }
                break;
            }
        }
    }
    let total: usize = per_port.iter().map(Vec::len).sum();

    let mut cache = WriteBackCache::new(config, mem)?;
    let requester = cache.requester();
    thread::scope(|s| -> Result<()> {
        let engine = s.spawn(|| cache.run());
        let producers: Vec<_> = per_port
            .into_iter()
            .enumerate()
            .map(|(port, stores)| {
                let requester = requester.clone();
                s.spawn(move || {
                    let r = stores
                        .into_iter()
                        .try_for_each(|(addr, value)| requester.submit(port, addr, value))
                        .and_then(|()| requester.close_port(port));
                    if r.is_err() {
                        // unblock the engine and the other producers
                        requester.request_shutdown();
                    }
                    r
                })
            })
            .collect();
        let mut first_err = None;
        for producer in producers {
            match producer.join() {
                // caused by another producer failing
                Ok(Ok(())) | Ok(Err(RequestError::ShutDown)) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(anyhow::Error::from(e));
                }
                Err(_) => {
                    first_err.get_or_insert(anyhow!("producer thread panicked"));
                }
            }
        }
        requester.request_shutdown();
        engine
            .join()
            .map_err(|_| anyhow!("engine thread panicked"))?;
        first_err.map_or(Ok(()), Err)
    })?;
    log::info!("replayed {total} stores; engine {}", cache.state());
    output_stat(&cache);
    Ok(())
}

fn replay_single_line<const N: usize>(
    config: SingleLineConfig,
    ops: Vec<SingleLineOp>,
    mem: &mut [u32],
) -> Result<()> {
    let mut cache = SingleLineCache::<u32, N>::new(config)?;
    cache.init();
    for op in ops {
        match op {
            SingleLineOp::Get { addr } => {
                let line = cache.get_line(mem, addr)?;
                log::info!("get {addr:#010x}: {line:?}");
            }
            SingleLineOp::Set { addr, line } => {
                let line: [u32; N] = line.as_slice().try_into().map_err(|_| {
                    anyhow!("set {addr:#010x}: expected {N} words, got {}", line.len())
                })?;
                cache.set_line(mem, addr, &line)?;
            }
        }
    }
    output_stat(&cache);
    Ok(())
}

#[cfg(not(feature = "stat"))]
fn output_stat<S>(_: &S) {}

#[cfg(feature = "stat")]
fn output_stat<S: AddStats>(source: &S) {
    let mut stats = Stats::default();
    source.add_stats(&mut stats);
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", stats.view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut buf = String::new();
    let mut file = File::open(path)?;
    file.read_to_string(&mut buf)?;
    Ok(buf)
}

fn dump_memory(dump: Option<PathBuf>, mem: &[u32]) -> Result<()> {
    if let Some(path) = dump {
        let out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(out, mem)?;
        log::info!("main memory dumped to {}", path.display());
    }
    Ok(())
}
