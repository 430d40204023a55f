// src/main.rs
use clap::{ArgAction, Parser, Subcommand};
use crossbeam_channel::Sender;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use massdisk::config::Config;
use massdisk::fuse_transport::FuseTransport;
use massdisk::image_factory::{parse_size, DEFAULT_IMAGE_SIZE, IMAGE_SIZES};
use massdisk::session::{SessionController, SessionEvent, SessionState};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser)]
#[command(name = "massdisk")]
#[command(version = "1.0.0")]
#[command(about = "Serve a disk image file as a virtual block device", long_about = "massdisk exposes one image file to the host as a block-addressable disk.\n\nThe image is published through a FUSE mount as a single file; every access\nis translated into 512-byte block commands against the backing image.\nUnmount the mount point or press Ctrl+C to eject.")]
struct Cli {
    /// Folder holding images (overrides MASSDISK_FOLDER)
    #[arg(short = 'd', long, value_name = "DIR", global = true)]
    folder: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve an existing image
    Select {
        #[arg(value_name = "IMAGE")]
        image: String,
        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,
    },
    /// Create a new image and serve it
    New {
        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,
        /// Name of the new image; prompted for when omitted
        #[arg(value_name = "NAME")]
        name: Option<String>,
        /// Preset (1.44M, 2M, 4M ... 2G), byte count, or K/M/G suffixed size
        #[arg(short, long, default_value = DEFAULT_IMAGE_SIZE)]
        size: String,
    },
    /// List the preset image sizes
    Sizes,
}

fn print_banner() {
    println!(r#"
    ┌┬┐┌─┐┌─┐┌─┐┌┬┐┬┌─┐┬┌─
    │││├─┤└─┐└─┐ │││└─┐├┴┐
    ┴ ┴┴ ┴└─┘└─┘─┴┘┴└─┘┴ ┴
    "#);
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    Builder::new()
    .format(|buf, record| {
        let style = buf.default_level_style(record.level());
        writeln!(buf, "[{} {}] {}",
                 buf.timestamp_seconds(),
                 style.value(record.level()),
                 record.args()
        )
    })
    .filter(None, level)
    .init();
}

// First Ctrl+C cancels the session, a second one gives up on a clean eject.
fn install_cancel_handler(events: Sender<SessionEvent>) {
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) > 0 {
            eprintln!("\n[!] Forced exit.");
            std::process::exit(130);
        }
        warn!("[!] Received Ctrl+C. Ejecting (press Enter if a name prompt is open)...");
        let _ = events.send(SessionEvent::Cancel);
    }).ok();
}

fn prompt_name() -> io::Result<Option<String>> {
    print!("[-] Enter image name: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn run_session(mut session: SessionController<FuseTransport>) -> anyhow::Result<()> {
    let events = session.sender();
    install_cancel_handler(events.clone());

    loop {
        match session.run() {
            SessionState::NameEntry { .. } => {
                if let Some(e) = session.take_error() {
                    error!("{}", e);
                }
                let answer = prompt_name()?;
                if session.has_pending_events() {
                    // Ctrl+C came in while waiting on stdin
                    warn!("Session cancelled, name discarded");
                    continue;
                }
                match answer {
                    Some(name) => events.send(SessionEvent::SubmitName(name))?,
                    None => events.send(SessionEvent::Cancel)?,
                }
            }
            _ => break,
        }
    }

    if let Some(e) = session.take_error() {
        anyhow::bail!("{}", e);
    }

    let model = session.presentation();
    println!("[+] Session closed. {}  {}", model.read_line(), model.write_line());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        let v = if cli.verbose == 0 { 1 } else { cli.verbose };
        init_logger(v);
    } else {
        env_logger::init();
    }

    let mut config = Config::from_env();
    if let Some(folder) = cli.folder {
        config = config.with_folder(folder);
    }

    match cli.command {
        Command::Sizes => {
            for (name, bytes) in IMAGE_SIZES {
                println!("{:>6}  {} bytes", name, bytes);
            }
            Ok(())
        }
        Command::Select { image, mount_point } => {
            print_banner();
            let path = config.resolve_image(&image);
            info!("Loading image {:?}...", path);

            let session = SessionController::new(config, FuseTransport::new(mount_point));
            session.sender().send(SessionEvent::SelectExisting(path))?;
            run_session(session)
        }
        Command::New { mount_point, name, size } => {
            print_banner();
            let size = parse_size(&size)?;
            if !config.folder.exists() {
                warn!("Image folder {:?} does not exist yet, it will be created", config.folder);
            }

            let session = SessionController::new(config, FuseTransport::new(mount_point));
            let events = session.sender();
            events.send(SessionEvent::CreateNew { size })?;
            if let Some(name) = name {
                events.send(SessionEvent::SubmitName(name))?;
            }
            run_session(session)
        }
    }
}
