//! Superio - inspect, exercise and benchmark superdomain array files.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use superio::backend::UNITS;
use superio::factory;
use superio::{ArrayIo, AttrValue, Backend, Communicator, DistArray, IoConfig, LocalCluster, SelfComm};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "superio")]
#[command(about = "Distributed array I/O over superdomain files", long_about = None)]
struct Cli {
    /// Enable logging to specified file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the variables and root attributes of a file set
    Inspect {
        /// Base path of the files, e.g. `out/run` for `out/run_0.hdf4`
        base: PathBuf,
    },
    /// Write a test array with one rank count and read it back with another
    Demo(DemoArgs),
    /// Measure the write rate of a format
    Bench(BenchArgs),
}

#[cfg(feature = "mpi")]
impl Command {
    fn uses_mpi(&self) -> bool {
        match self {
            Command::Demo(args) => args.transfer.mpi,
            Command::Bench(args) => args.transfer.mpi,
            Command::Inspect { .. } => false,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct TransferArgs {
    /// File format extension (hdf, dmp, hdf4, hdf5, phdf5)
    #[arg(long, default_value = "hdf4")]
    format: String,

    /// Global extents of the test array
    #[arg(long, value_delimiter = ',', default_value = "16,15,13")]
    dims: Vec<usize>,

    /// Directory receiving the files
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Number of writing ranks
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Number of ranks touching the files (defaults to every writer)
    #[arg(long)]
    super_size: Option<usize>,

    /// Move each rank's slab separately when writing a shared file
    #[arg(long)]
    independent_write: bool,

    /// Run as one rank of an MPI job (launch with mpirun); rank counts come from the job
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,

    /// Move whole datasets in one call when reading a shared file
    #[arg(long)]
    collective_read: bool,
}

impl TransferArgs {
    fn config(&self, super_size: Option<usize>) -> IoConfig {
        let mut config = IoConfig::with_super_size(super_size);
        config.parallel.collective_write = !self.independent_write;
        config.parallel.collective_read = self.collective_read;
        config
    }

    fn open(&self, comm: Arc<dyn Communicator>, super_size: Option<usize>) -> Result<Box<dyn Backend>> {
        let io = factory::select_with_config(&self.format, &self.config(super_size), comm)
            .ok_or_else(|| anyhow!("Unknown format '{}'", self.format))?;
        if !io.is_enabled() {
            bail!("The '{}' backend is disabled in this build", self.format);
        }
        Ok(io)
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[command(flatten)]
    transfer: TransferArgs,

    /// Number of reading ranks
    #[arg(long, default_value_t = 3)]
    read_ranks: usize,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[command(flatten)]
    transfer: TransferArgs,

    /// Number of timed writes
    #[arg(long, default_value_t = 3)]
    iterations: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging if --log option is provided
    if let Some(log_path) = &cli.log {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        tracing::info!("Starting superio");
    }

    #[cfg(feature = "mpi")]
    let universe = if cli.command.uses_mpi() {
        Some(mpi::initialize().ok_or_else(|| anyhow!("MPI was already initialized"))?)
    } else {
        None
    };
    #[cfg(feature = "mpi")]
    let ranks = Ranks {
        world: universe.as_ref().map(superio::MpiComm::world),
    };
    #[cfg(not(feature = "mpi"))]
    let ranks = Ranks { world: None };

    let result = match &cli.command {
        Command::Inspect { base } => inspect(base),
        Command::Demo(args) => demo(args, &ranks),
        Command::Bench(args) => bench(args, &ranks),
    };

    if cli.log.is_some() {
        tracing::info!("superio exited");
    }
    result
}

/// Where the ranks of a demo or bench run live.
struct Ranks {
    /// This process's MPI world, when launched as an MPI job.
    world: Option<Arc<dyn Communicator>>,
}

impl Ranks {
    /// Run `body` on `count` in-process ranks, or once on this process's
    /// MPI rank. Results come back for the ranks this process hosts.
    fn run<T: Send>(
        &self,
        count: usize,
        body: impl Fn(Arc<dyn Communicator>) -> Result<T> + Sync,
    ) -> Result<Vec<T>> {
        if let Some(world) = &self.world {
            return Ok(vec![body(Arc::clone(world))?]);
        }
        LocalCluster::new(count)
            .run(body)
            .map_err(|abort| anyhow!("{abort}"))?
            .into_iter()
            .collect()
    }

    fn count(&self, requested: usize) -> usize {
        self.world.as_ref().map_or(requested, |world| world.size())
    }

    fn leader(&self) -> bool {
        self.world.as_ref().map_or(true, |world| world.rank() == 0)
    }
}

/// Fail with the backend's queued diagnostics unless `ok`.
fn check(io: &mut dyn Backend, ok: bool, what: &str) -> Result<()> {
    if ok {
        return Ok(());
    }
    let detail = io.errors().drain();
    Err(anyhow!("Failed to {what}\n{}", detail.trim_end()))
}

fn split_base(base: &Path) -> Result<(PathBuf, String)> {
    let stem = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("{} has no file name", base.display()))?;
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, stem))
}

fn inspect(base: &Path) -> Result<()> {
    let (dir, stem) = split_base(base)?;
    // Shard 0 alone describes the file set.
    let mut io = factory::select_by_directory_scan(&stem, &dir, Some(1), SelfComm::shared())
        .ok_or_else(|| anyhow!("No superio files for '{}' in {}", stem, dir.display()))?;
    let opened = io.open_read(base);
    check(io.as_mut(), opened, &format!("open {}", base.display()))?;

    let file = io.kind().file_name(base, io.extension(), 0);
    println!("{}: {} format", file.display(), io.kind());

    println!("attributes:");
    for name in io.attribute_names() {
        match io.read_attribute(&name, "") {
            Some(value) => println!("  {name} = {value}"),
            None => println!("  {name}"),
        }
    }

    println!("variables:");
    for path in io.variable_names() {
        let mut info = superio::ArrayInfo::default();
        if io.get_local_array_info(&path, &mut info) {
            println!("  {path}: {info}");
        } else {
            println!("  {path}: unreadable shape");
        }
        if let Some(AttrValue::Str(units)) = io.read_attribute(UNITS, &path) {
            println!("    units = \"{units}\"");
        }
    }

    // Absent units are expected; only report what the listing could not show.
    io.errors().drain();
    let closed = io.close();
    check(io.as_mut(), closed, "close")
}

/// Row-major position of `index` in `dims`, the value every demo element holds.
fn linear(index: &[usize], dims: &[usize]) -> usize {
    index.iter().zip(dims).fold(0, |acc, (&i, &d)| acc * d + i)
}

fn demo(args: &DemoArgs, ranks: &Ranks) -> Result<()> {
    let transfer = &args.transfer;
    let base = transfer.dir.join("demo");
    let dims = transfer.dims.clone();
    let stacked: Vec<usize> = dims.iter().copied().chain([2]).collect();

    let writers = ranks.count(transfer.ranks);
    let readers = ranks.count(args.read_ranks);

    ranks.run(writers, |comm| -> Result<()> {
        let mut io = transfer.open(comm.clone(), transfer.super_size)?;
        let opened = io.open_write(&base);
        check(io.as_mut(), opened, "open for write")?;

        let mut array = DistArray::<f32>::new(comm.clone(), &dims)?;
        array.fill_with(|index| linear(index, &dims) as f32);
        let mut fields = DistArray::<f64>::with_vars(comm, &dims, 2)?;
        fields.fill_with(|index| linear(index, &stacked) as f64);

        let mut typed = ArrayIo::new(io.as_mut());
        typed.write_shape("testData", &array)?;
        typed.write_var_units("testVar", "testData", &array, "megaTests")?;
        typed.write_multi_var("testMultiVar", "testData", &fields)?;
        typed.write_attribute0("ranks", "", writers as i32)?;
        let closed = io.close();
        check(io.as_mut(), closed, "close")
    })?;
    if ranks.leader() {
        println!("wrote {:?} from {} ranks to {}", dims, writers, transfer.dir.display());
    }

    let mismatches = ranks
        .run(readers, |comm| -> Result<usize> {
            let mut io = transfer.open(comm.clone(), None)?;
            let opened = io.open_read(&base);
            check(io.as_mut(), opened, "open for read")?;

            let mut array = DistArray::<f32>::new(comm.clone(), &dims)?;
            let mut fields = DistArray::<f64>::with_vars(comm, &dims, 2)?;
            let mut typed = ArrayIo::new(io.as_mut());
            if !typed.check_conformity("testData", &array)? {
                bail!("stored shape of testData differs from {:?}", dims);
            }
            let units = typed.read_var_units("testVar", "testData", &mut array)?;
            typed.read_multi_var("testMultiVar", "testData", &mut fields)?;
            let closed = io.close();
            check(io.as_mut(), closed, "close")?;

            if units.as_deref() != Some("megaTests") {
                bail!("testVar has units {:?}", units);
            }
            let start = &array.region().start;
            let mut bad = 0;
            for (local, value) in array.local().indexed_iter() {
                let index: Vec<usize> = (0..dims.len()).map(|a| start[a] + local[a]).collect();
                if *value != linear(&index, &dims) as f32 {
                    bad += 1;
                }
            }
            let start = &fields.region().start;
            for (local, value) in fields.local().indexed_iter() {
                let index: Vec<usize> = (0..stacked.len()).map(|a| start[a] + local[a]).collect();
                if *value != linear(&index, &stacked) as f64 {
                    bad += 1;
                }
            }
            Ok(bad)
        })?
        .into_iter()
        .sum::<usize>();

    if mismatches > 0 {
        bail!("{} elements differ after reading with {} ranks", mismatches, readers);
    }
    if ranks.leader() {
        println!("read back with {} ranks: round trip ok", readers);
    }
    Ok(())
}

fn bench(args: &BenchArgs, ranks: &Ranks) -> Result<()> {
    let transfer = &args.transfer;
    let base = transfer.dir.join("bench");
    let dims = transfer.dims.clone();
    let iterations = args.iterations.max(1);

    let writers = ranks.count(transfer.ranks);

    let timings = ranks.run(writers, |comm| -> Result<f64> {
        let mut array = DistArray::<f64>::new(comm.clone(), &dims)?;
        array.fill_with(|index| linear(index, &dims) as f64);
        let mut io = transfer.open(comm.clone(), transfer.super_size)?;

        comm.barrier()?;
        let started = Instant::now();
        for _ in 0..iterations {
            let opened = io.open_write(&base);
            check(io.as_mut(), opened, "open for write")?;
            ArrayIo::new(io.as_mut()).write_variable("bench", "", &array)?;
            let closed = io.close();
            check(io.as_mut(), closed, "close")?;
        }
        comm.barrier()?;
        Ok(started.elapsed().as_secs_f64())
    })?;

    let seconds = timings.into_iter().fold(0.0, f64::max);
    let bytes = dims.iter().product::<usize>() * std::mem::size_of::<f64>() * iterations;
    let rate = bytes as f64 / seconds.max(f64::EPSILON) / 1.0e6;
    if ranks.leader() {
        println!(
            "{}: wrote {} bytes from {} ranks in {:.3}s ({:.1} MB/s)",
            transfer.format, bytes, writers, seconds, rate
        );
    }
    Ok(())
}
