use tinystat::prelude::*;
use tinystat::supervisor::LinkStates;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Display more information on the console. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Seconds to wait when scanning for bluetooth devices
    #[arg(short, long, value_name = "SECONDS", default_value_t = 3.0)]
    scantime: f32,

    /// Accept devices whose name starts with this prefix. Can be used
    /// multiple times, defaults to the TinyBLEStat names.
    #[arg(short, long, value_name = "PREFIX")]
    prefix: Vec<String>,

    /// Milliseconds between two telemetry reads
    #[arg(long, value_name = "MS", default_value_t = 200)]
    poll_ms: u64,

    /// Milliseconds to wait for a single telemetry read
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    timeout_ms: u64,

    /// Number of samples kept per device
    #[arg(long, value_name = "SAMPLES", default_value_t = 25)]
    capacity: usize,

    /// Disable a device after this many failed connection attempts
    #[arg(long, value_name = "COUNT")]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for TinyBLEStat devices
    Scan {},

    /// Write the telemetry of the first TinyBLEStat found to the console
    Print {},

    /// Read and decode the configuration of the first TinyBLEStat found
    Show {},

    /// Run the fleet manager against a simulated sensor and print its export
    Demo {
        /// Number of samples to collect before exporting
        #[arg(short, long, default_value_t = 10)]
        samples: usize,

        /// Write the export into this directory instead of the console
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Encode a configuration and print the register image
    Encode {
        /// AFE channel the register flags apply to (0 or 1)
        #[arg(long, default_value_t = 0)]
        channel: u8,

        /// DAC trim in percent
        #[arg(long, default_value_t = 50.0)]
        dac: f64,

        /// TIA gain code (0-7)
        #[arg(long, default_value_t = 0)]
        gain: u8,

        /// Load resistance code (0-3)
        #[arg(long, default_value_t = 3)]
        load: u8,

        /// Internal zero code (0-3)
        #[arg(long, default_value_t = 1)]
        internal_zero: u8,

        /// Signed bias code (-15 to 15)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        bias: i8,

        /// Operating mode code (0-7)
        #[arg(long, default_value_t = 0)]
        mode: u8,

        /// Use the internal voltage reference
        #[arg(long)]
        internal_reference: bool,

        /// Close the shorting FET
        #[arg(long)]
        shorting_fet: bool,
    },
}

impl Cli {
    fn app(&self) -> App {
        let defaults = App::default();
        App {
            verbose: self.verbose,
            scantime: self.scantime,
            name_prefixes: if self.prefix.is_empty() {
                defaults.name_prefixes
            } else {
                self.prefix.clone()
            },
            poll_period: Duration::from_millis(self.poll_ms),
            read_timeout: Duration::from_millis(self.timeout_ms),
            connect_timeout: defaults.connect_timeout,
            telemetry_capacity: self.capacity.max(1),
            max_retries: self.max_retries,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Waits until some device reaches `Ready` and returns its id.
async fn first_ready(handle: &SupervisorHandle, within: Duration) -> Result<DeviceId> {
    let mut states = handle.link_states();
    let wait = async {
        loop {
            let ready = find_ready(&states.borrow_and_update());
            if let Some(id) = ready {
                return Ok(id);
            }
            if states.changed().await.is_err() {
                return Err(tinystat::error::Error::Closed);
            }
        }
    };
    time::timeout(within, wait)
        .await
        .map_err(|_| tinystat::error::Error::Timeout(within))?
}

fn find_ready(states: &LinkStates) -> Option<DeviceId> {
    let mut ready: Vec<&DeviceId> = states
        .iter()
        .filter(|(_, state)| **state == LinkState::Ready)
        .map(|(id, _)| id)
        .collect();
    ready.sort();
    ready.first().map(|id| (*id).clone())
}

fn print_config(record: &SensorRecord) {
    println!("{} ({})", record.display_name(), record.device_id());
    println!("  DAC trim: {:.2}%", record.config.dac_percent);
    for channel in Channel::ALL {
        let afe = record.channel_config(channel);
        println!("  AFE{}:", channel.index());
        println!("    reference:      {:?}", afe.reference);
        println!("    bias:           {}", afe.bias_label());
        println!("    internal zero:  {}", afe.internal_zero_label());
        println!("    load:           {}", afe.load_label());
        println!("    gain:           {}", afe.gain_label());
        println!("    shorting FET:   {}", afe.shorting_fet);
        println!("    operating mode: {}", afe.operating_mode_label());
    }
}

async fn scan(app: &App) -> Result<()> {
    let transport = BtleTransport::new(app).await?;
    let found = transport.scan(app).await?;
    if found.is_empty() {
        println!("No TinyBLEStat found.");
    }
    for (id, name) in found {
        println!("Found {name} ({id})");
    }
    Ok(())
}

async fn start_hardware(app: &App) -> Result<SupervisorHandle> {
    let transport: Arc<dyn Transport> = Arc::new(BtleTransport::new(app).await?);
    let (supervisor, handle) = Supervisor::new(app.clone(), transport, DeviceRegistry::new());
    tokio::spawn(async move {
        if let Err(err) = supervisor.run().await {
            log::error!("Fleet manager stopped: {err}");
        }
    });
    Ok(handle)
}

async fn stream(app: &App) -> Result<()> {
    let handle = start_hardware(app).await?;
    let within = Duration::from_secs_f32(app.scantime) + app.connect_timeout;
    let id = first_ready(&handle, within).await?;
    println!("Streaming {id}, timestamp / channel 0 / channel 1");

    let mut snapshots = handle.registry().subscribe();
    let mut last = i64::MIN;
    while snapshots.changed().await.is_ok() {
        let Some(record) = handle.registry().get(&id) else {
            break;
        };
        for (timestamp, channel0, channel1) in record.telemetry.rows() {
            if timestamp > last {
                println!("{timestamp}\t{channel0}\t{channel1}");
                last = timestamp;
            }
        }
    }
    Ok(())
}

async fn show(app: &App) -> Result<()> {
    let handle = start_hardware(app).await?;
    let within = Duration::from_secs_f32(app.scantime) + app.connect_timeout;
    let id = first_ready(&handle, within).await?;
    let record = handle.reload_config(&id).await?;
    print_config(&record);
    handle.shutdown().await
}

async fn demo(app: &App, samples: usize, output: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let sim = Arc::new(SimTransport::new());
    sim.add_device("Clarkson Demo");
    let registry = DeviceRegistry::new();
    let transport: Arc<dyn Transport> = sim.clone();
    let (supervisor, handle) = Supervisor::new(app.clone(), transport, registry.clone());
    let task = tokio::spawn(supervisor.run());

    let id = first_ready(&handle, app.connect_timeout).await?;
    let wanted = samples.clamp(1, app.telemetry_capacity);
    let mut snapshots = registry.subscribe();
    loop {
        let collected = registry.get(&id).map_or(0, |record| record.telemetry.len());
        if collected >= wanted {
            break;
        }
        log::info!("{collected}/{wanted} samples");
        snapshots.changed().await?;
    }
    handle.shutdown().await?;
    task.await??;

    let Some(record) = registry.get(&id) else {
        return Err(tinystat::error::Error::UnknownDevice(id).into());
    };
    let text = export::render(&record)?;
    match output {
        Some(dir) => {
            let path = dir.join(export::file_name(&record, &chrono::Local::now()));
            std::fs::write(&path, text)?;
            println!("Wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if cli.verbose > 1 {
        dbg!(&cli);
    }

    let conf = cli.app();

    match &cli.command {
        Some(Commands::Scan {}) => {
            scan(&conf).await?;
        }
        Some(Commands::Print {}) => {
            stream(&conf).await?;
        }
        Some(Commands::Show {}) => {
            show(&conf).await?;
        }
        Some(Commands::Demo { samples, output }) => {
            demo(&conf, *samples, output.as_ref()).await?;
        }
        Some(Commands::Encode {
            channel,
            dac,
            gain,
            load,
            internal_zero,
            bias,
            mode,
            internal_reference,
            shorting_fet,
        }) => {
            let afe = AfeConfig {
                reference: if *internal_reference {
                    ReferenceSource::Internal
                } else {
                    ReferenceSource::External
                },
                bias: *bias,
                internal_zero: *internal_zero,
                load_resistance: *load,
                gain: *gain,
                shorting_fet: *shorting_fet,
                operating_mode: *mode,
            };
            let config = DeviceConfig::default()
                .with_dac_percent(*dac)
                .with_channel(Channel::try_from(*channel)?, afe);
            let bytes = protocol::encode(&config)?;
            println!("{}", protocol::config_as_csv(&bytes));
        }
        None => {
            <Cli as clap::CommandFactory>::command().print_help()?;
        }
    }

    Ok(())
}
