use clap::Parser;
use smart_meter_to_openhab::{
    FileDumpSink, ItemNames, MeterSampler, OpenhabConfig, OpenhabConnection, ReadValidator,
    ReadValidatorConfig, SerialByteSource,
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, Level};

/// Time span the reference values for the outlier check are taken from
const REFERENCE_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Parser, Debug)]
#[command(
    version,
    about = "A tool to push data of an ISKRA MT175 smart meter to openHAB. Configure the \
             openHAB connection and items via environment variables."
)]
struct Args {
    /// Serial device the optical reading head is connected to
    #[arg(long, default_value = "/dev/ttyUSB0")]
    serial_port: String,

    /// Number of reads that are averaged per interval, one second apart
    #[arg(short = 'c', long, default_value_t = 5)]
    smart_meter_read_count: usize,

    /// Interval in which the data will be read and pushed
    #[arg(long, default_value_t = 10)]
    interval_in_sec: u64,

    /// Reinit if no data can be found in the openHAB DB in the given timeframe
    #[arg(long, default_value_t = 10)]
    ping_in_min: u64,

    /// Exit process with return code 1 when pinging stays unsuccessful
    #[arg(long, default_value_t = 5)]
    max_reinit: u32,

    /// Store rejected SML frames in this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Write logging to this file instead of to stdout
    #[arg(long)]
    logfile: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_level_from_arg(verbosity_count: u8) -> Level {
    match verbosity_count {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = log_level_from_arg(args.verbose);
    match &args.logfile {
        Some(path) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(Mutex::new(File::create(path)?))
            .init(),
        None => tracing_subscriber::fmt().with_max_level(level).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    info!(
        "Starting smart_meter_to_openhab version {}",
        env!("CARGO_PKG_VERSION")
    );

    let oh_config = OpenhabConfig::from_env()?;
    let items = ItemNames::from_env();
    let process_start = Instant::now();

    let mut unsuccessful_reinit_count = 0;
    while unsuccessful_reinit_count < args.max_reinit {
        match run(&args, &oh_config, &items, process_start).await {
            Ok(true) => unsuccessful_reinit_count = 0,
            Ok(false) => {
                unsuccessful_reinit_count += 1;
                error!("No improvement after reinit. Trying again.");
            }
            Err(e) => {
                unsuccessful_reinit_count += 1;
                error!("Caught error: {e:#}");
                sleep(Duration::from_secs(args.interval_in_sec)).await;
            }
        }
    }

    error!("Unable to upload valid data to openHAB. Exiting Process with Return Code 1.");
    std::process::exit(1);
}

/// Transfers readings until the openHAB items stop being updated.
/// Returns whether at least one ping succeeded before that.
async fn run(
    args: &Args,
    oh_config: &OpenhabConfig,
    items: &ItemNames,
    process_start: Instant,
) -> anyhow::Result<bool> {
    let connection = OpenhabConnection::new(oh_config.clone());
    let source = SerialByteSource::open(&args.serial_port)?;
    let mut validator = ReadValidator::new(source, ReadValidatorConfig::default());
    if let Some(dir) = &args.dump_dir {
        validator = validator.with_dump_sink(Box::new(FileDumpSink::new(dir)?));
    }
    let mut sampler = MeterSampler::new(validator);
    info!("Connections established. Starting to transfer smart meter values to openHAB.");

    let ping_window = Duration::from_secs(args.ping_in_min * 60);
    let read_count = args.smart_meter_read_count;
    let mut ping_succeeded = false;

    loop {
        info!("Reading SML data");
        let reference = connection
            .get_median_reference(items, REFERENCE_WINDOW)
            .await;

        // Reading the serial port blocks, keep it off the async workers
        let (returned, sampled) = tokio::task::spawn_blocking(move || {
            let sampled = sampler.read_avg(read_count, &reference);
            (sampler, sampled)
        })
        .await?;
        sampler = returned;

        info!("current values: {}", sampled.reading);
        info!("current extended values: {}", sampled.extended);
        connection.post_reading(&sampled.reading, items).await;
        connection.post_extended(&sampled.extended, items).await;
        info!("Values posted to openHAB");

        sleep(Duration::from_secs(args.interval_in_sec)).await;

        // Start pinging after the process is running for the ping window
        if process_start.elapsed() > ping_window {
            if !connection.check_if_updated(items, ping_window).await {
                break;
            }
            ping_succeeded = true;
            info!("openHAB items ping successful.");
        }
    }

    error!("openHAB items seem to have not been updated - reinit process");
    Ok(ping_succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_arg() {
        assert_eq!(log_level_from_arg(0), Level::ERROR);
        assert_eq!(log_level_from_arg(1), Level::WARN);
        assert_eq!(log_level_from_arg(2), Level::INFO);
        assert_eq!(log_level_from_arg(3), Level::DEBUG);
        assert_eq!(log_level_from_arg(7), Level::DEBUG);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["smart_meter_to_openhab"]);
        assert_eq!(args.serial_port, "/dev/ttyUSB0");
        assert_eq!(args.smart_meter_read_count, 5);
        assert_eq!(args.interval_in_sec, 10);
        assert_eq!(args.ping_in_min, 10);
        assert_eq!(args.max_reinit, 5);
        assert_eq!(args.verbose, 0);
        assert!(args.dump_dir.is_none());
    }

    #[test]
    fn test_args_verbosity_and_dump_dir() {
        let args = Args::parse_from([
            "smart_meter_to_openhab",
            "-vvv",
            "-c",
            "3",
            "--dump-dir",
            "/tmp/sml",
        ]);
        assert_eq!(args.verbose, 3);
        assert_eq!(args.smart_meter_read_count, 3);
        assert_eq!(args.dump_dir, Some(PathBuf::from("/tmp/sml")));
    }
}
