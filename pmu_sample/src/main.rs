use clap::Parser;
use log::{error, info, warn};
use pmu_sample::{catalog, ControlChannel, Report, SampleError, Sampler};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use x86_perf_counter::CounterSet;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Built-in event set to program, see --list
    #[arg(short, long, default_value_t = 1)]
    level: u64,
    /// JSON file with up to eight events, used instead of --level
    #[arg(short, long)]
    events: Option<PathBuf>,
    /// Core to pin to and measure on
    #[arg(short, long, default_value_t = 0)]
    core: u32,
    /// Control device node
    #[arg(short, long, default_value = pmu_device::DEVICE_PATH)]
    device: PathBuf,
    /// Program the counters from this process through /dev/cpu/N/msr
    #[arg(short, long)]
    msr: bool,
    /// Print the built-in event sets and exit
    #[arg(long)]
    list: bool,
    /// Print the report as JSON
    #[arg(short, long)]
    json: bool,
    /// The command to measure; without one an empty interval is sampled
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    if args.list {
        print_catalog();
        return ExitCode::SUCCESS;
    }

    let report = match run(&args) {
        Ok(report) => report,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string(&report) {
            Ok(json) => println!("{}", json),
            Err(err) => {
                error!("Failed to serialize the report: {}", err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", report);
    }
    ExitCode::SUCCESS
}

fn print_catalog() {
    for level in catalog::LEVELS {
        println!("level {}: {}", level.level, level.description);
        for (index, named) in level.events.iter().enumerate() {
            println!(
                "  pmc{} {:<52} event={:#04x} umask={:#04x} cmask={}",
                index,
                named.name,
                named.event.selector,
                named.event.sub_selector,
                named.event.count_mask
            );
        }
    }
}

fn event_set(args: &Args) -> Result<CounterSet, SampleError> {
    let events = match &args.events {
        Some(path) => catalog::load_events(path)?,
        None => catalog::level(args.level)?.counter_set()?,
    };
    info!("{} events selected", events.len());
    Ok(events)
}

#[cfg(target_arch = "x86_64")]
fn run(args: &Args) -> Result<Report, SampleError> {
    use pmu_device::PmuDevice;
    use pmu_sample::msr::{self, MsrDevicePort};
    use pmu_sample::{pin_to_core, DeviceFile};
    use x86_perf_counter::{CoreId, Programmer, ProgrammerConfig};

    let events = event_set(args)?;
    pin_to_core(args.core)?;

    if !args.msr {
        return sample(DeviceFile::open(&args.device)?, &events, &args.command);
    }

    let port = MsrDevicePort::open_online().map_err(SampleError::io(msr::ONLINE_CPUS))?;
    let device = PmuDevice::new(Programmer::new(
        port,
        CoreId(args.core),
        ProgrammerConfig::default(),
    ));
    let report = sample(device.open()?, &events, &args.command);
    device.unload()?;
    report
}

#[cfg(not(target_arch = "x86_64"))]
fn run(_args: &Args) -> Result<Report, SampleError> {
    Err(SampleError::Unsupported)
}

#[cfg(target_arch = "x86_64")]
fn sample(
    channel: impl ControlChannel,
    events: &CounterSet,
    command: &[String],
) -> Result<Report, SampleError> {
    use x86_perf_counter::Rdpmc;

    // Safety: the thread is pinned and no counter is read before the start
    // request has granted user-mode rdpmc on this core.
    let source = unsafe { Rdpmc::new() };
    let mut sampler = Sampler::new(channel, source, timestamp);

    sampler.start(events)?;
    let (status, report) = sampler.measure(|| run_command(command));
    let stopped = sampler.stop();

    status?;
    stopped?;
    Ok(report)
}

#[cfg(target_arch = "x86_64")]
fn timestamp() -> u64 {
    // Safety: rdtsc is unprivileged unless CR4.TSD is set, which Linux does
    // not do for ordinary tasks.
    unsafe { x86::time::rdtsc() }
}

fn run_command(command: &[String]) -> Result<(), SampleError> {
    let Some((program, arguments)) = command.split_first() else {
        return Ok(());
    };
    let status = Command::new(program)
        .args(arguments)
        .status()
        .map_err(SampleError::io(program))?;
    if !status.success() {
        warn!("{} exited with {}", program, status);
    }
    Ok(())
}
