use clap::{Parser, Subcommand};
use log::LevelFilter;
use miette::Result;

use esp8266_flasher::{
    cli::{ConsoleObserver, Esp8266FlashArgs, FileBundle, StdinPrompter},
    hal::{format_mac, Esp8266Hal},
    interface::Interface,
    logging,
};

const ROM_BAUD: u32 = 115_200;

#[derive(Debug, Parser)]
#[command(name = "esp8266-flasher", about, version, propagate_version = true)]
struct Cli {
    /// Serial port connected to the device
    #[arg(short = 'p', long, value_name = "PORT")]
    port: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check that a device in flashing mode is attached and print its MAC
    Probe,
    /// Reboot the device into its firmware
    Reboot,
    /// Flash one or more images, each given as ADDR[:TYPE]:FILE
    Flash {
        #[arg(required = true, value_name = "ADDR[:TYPE]:FILE")]
        images: Vec<String>,

        #[command(flatten)]
        args: Esp8266FlashArgs,
    },
}

fn main() -> Result<()> {
    logging::initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    let serial = Interface::open(&cli.port, ROM_BAUD)?;
    let mut hal = Esp8266Hal::new(serial);

    match cli.command {
        Commands::Probe => {
            let mac = hal.mac()?;
            println!("{} {}", hal.name(), format_mac(mac));
        }
        Commands::Reboot => {
            hal.reboot()?;
        }
        Commands::Flash { images, args } => {
            let opts = args.into_opts()?;
            let bundle = FileBundle::from_specs(&images)?;

            let flasher = hal.into_flasher(Box::new(StdinPrompter));
            flasher.set_opts(opts);
            flasher.set_firmware(&bundle)?;

            let mut observer = ConsoleObserver::new(flasher.total_bytes());
            flasher.run(&mut observer);
            if !observer.succeeded() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
