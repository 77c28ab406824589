use clap::{value_parser, Arg, ArgMatches, Command};
use log::{info, LevelFilter};
use simplelog::{ConfigBuilder, LevelPadding, WriteLogger};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use lesidrive::backend::{ImageBackend, BLOCK_SIZE};
use lesidrive::error::DriveError;
use lesidrive::mscp::hostif::Step;
use lesidrive::mscp::opcode::{opcode_name, OP_END, OP_ONLIN, OP_READ, OP_STCON, ST_SUCC};
use lesidrive::mscp::packet::{self, ControllerParams, EndHeader, Transfer};
use lesidrive::mscp::server::UnitState;
use lesidrive::sim::{HostConfig, HostDriver, HostResponse, SimulatedKlesi};
use lesidrive::{Config, Drive};
use lesidrive_utils::hexprint::pretty_print_hex_block_zero;

const DISK_A_PATH: &str = "DISK_A_PATH";
const DISK_B_PATH: &str = "DISK_B_PATH";
const BUS: &str = "BUS";
const BLOCK: &str = "BLOCK";
const LOG_PATH: &str = "LOG_PATH";
const LOG_LEVEL: &str = "LOG_LEVEL";

/// Host memory given to the simulated bus.
const MEMORY_SIZE: usize = 0x10000;
/// Polls allowed for the initialization handshake.
const HANDSHAKE_POLLS: usize = 100;
/// Bytes offered for each response.
const RESPONSE_BUFFER: u16 = 64;
const MEDIA_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const DISK_MSG: &str = "\
LESIDrive needs a directory for each unit; these must be present to\n\
launch. The folders default to ./DiskA and ./DiskB in the current\n\
working directory, but can also be specified by the --disk-a and\n\
--disk-b options. Place a disk image in a folder to insert it.";

#[derive(Debug)]
struct CliError(String);

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CliError {
    fn from(msg: String) -> Self {
        CliError(msg)
    }
}

impl From<&str> for CliError {
    fn from(msg: &str) -> Self {
        CliError(msg.to_string())
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError(e.to_string())
    }
}

impl From<DriveError> for CliError {
    fn from(e: DriveError) -> Self {
        CliError(format!("Failed to start the drive: {}", e))
    }
}

impl From<log::SetLoggerError> for CliError {
    fn from(e: log::SetLoggerError) -> Self {
        CliError(format!("Failed to initialise logging: {}", e))
    }
}

fn cli() -> Command {
    // Hack to make the build dirty when the toml changes.
    include_str!("../../Cargo.toml");

    clap::command!()
        .max_term_width(100)
        .after_help(
            "This is the LESIDrive storage controller, running against a simulated \
             host. It brings up the MSCP port, puts unit 0 online and reads one \
             block from the image in the Disk A folder, printing it as hex.",
        )
        .arg(
            Arg::new(DISK_A_PATH)
                .help("The path to the folder for unit 0 (defaults to ./DiskA).")
                .long("disk-a")
                .default_value("DiskA"),
        )
        .arg(
            Arg::new(DISK_B_PATH)
                .help("The path to the folder for unit 1 (defaults to ./DiskB).")
                .long("disk-b")
                .default_value("DiskB"),
        )
        .arg(
            Arg::new(BUS)
                .help("The host bus the adapter sits on.")
                .long("bus")
                .default_value("qbus")
                .value_parser(["qbus", "unibus"]),
        )
        .arg(
            Arg::new(BLOCK)
                .help("The logical block to read from unit 0.")
                .long("block")
                .default_value("0")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new(LOG_PATH)
                .help("If set, a debug log will be written to the given path.")
                .short('l')
                .long("log"),
        )
        .arg(
            Arg::new(LOG_LEVEL)
                .help(
                    "Set the log level. Has no effect without \
                   specifying --log as well. Case insensitive.",
                )
                .short('L')
                .long("log-level")
                .default_value("trace")
                .value_parser(["trace", "debug", "info"])
                .ignore_case(true),
        )
}

/// Ensure that the given path exists and is a directory.
fn check_disk_path(path: &str) -> Result<(), CliError> {
    match fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                Err(format!("'{}' is not a directory.\n\n{}", path, DISK_MSG).into())
            } else {
                Ok(())
            }
        }
        Err(e) => Err(format!("Could not access '{}': {}\n\n{}", path, e, DISK_MSG).into()),
    }
}

fn log_level(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        _ => LevelFilter::Trace,
    }
}

/// Initialise logging to the given file.
fn init_logging(logfile: File, level: LevelFilter) -> Result<(), CliError> {
    let config = ConfigBuilder::new()
        .set_level_padding(LevelPadding::Right)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_time_format_custom(time::macros::format_description!(
            "[hour]:[minute]:[second].[subsecond digits:6]"
        ))
        .add_filter_ignore_str("mio")
        .build();

    WriteLogger::init(level, config, logfile)?;
    Ok(())
}

/// A command packet with the parameters filled in by `fill`.
fn command_body(
    cmdref: u32,
    opcode: u8,
    fill: impl FnOnce(&mut [u8]) -> io::Result<()>,
) -> io::Result<Vec<u8>> {
    let mut body = packet::Command {
        cmdref,
        unit: 0,
        opcode,
        flags: 0,
        modifier: 0,
    }
    .encode()?;
    fill(&mut body)?;
    Ok(body)
}

/// Poll the drive until the host has a response.
fn await_response(
    drive: &mut Drive<SimulatedKlesi, ImageBackend>,
    host: &mut HostDriver,
) -> Result<HostResponse, CliError> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    loop {
        drive.poll();
        if let Some(response) = host.take_response() {
            host.offer_response_slot(RESPONSE_BUFFER);
            return Ok(response);
        }
        if Instant::now() > deadline {
            return Err("Timed out waiting for a response.".into());
        }
        thread::yield_now();
    }
}

/// Send one command and check that it succeeded.
fn exchange(
    drive: &mut Drive<SimulatedKlesi, ImageBackend>,
    host: &mut HostDriver,
    body: &[u8],
) -> Result<HostResponse, CliError> {
    if !host.post_command(body, 0) {
        return Err("The command ring is full.".into());
    }
    let response = await_response(drive, host)?;
    let end = EndHeader::parse(&response.data)?;
    let name = opcode_name(end.endcode & !OP_END);
    if end.status != ST_SUCC {
        return Err(format!("{} failed with status {:#06X}.", name, end.status).into());
    }
    info!("{} succeeded", name);
    Ok(response)
}

fn read_block(
    drive: &mut Drive<SimulatedKlesi, ImageBackend>,
    host: &mut HostDriver,
    block: u32,
) -> Result<Vec<u8>, CliError> {
    // Handshake.
    host.script_init();
    for _ in 0..HANDSHAKE_POLLS {
        drive.poll();
        if drive.port().step() == Step::Ready {
            break;
        }
    }
    if drive.port().step() != Step::Ready {
        return Err(format!("Port initialization stalled in {:?}.", drive.port().step()).into());
    }
    for _ in 0..(1 << host.config().rring_exp) {
        host.offer_response_slot(RESPONSE_BUFFER);
    }

    // Wait for the image in unit 0 to be noticed.
    let deadline = Instant::now() + MEDIA_TIMEOUT;
    while drive.server().units()[0].state() == UnitState::Offline {
        if Instant::now() > deadline {
            return Err(format!("No disk image found for unit 0.\n\n{}", DISK_MSG).into());
        }
        drive.poll();
        thread::sleep(Duration::from_millis(1));
    }

    let stcon = command_body(1, OP_STCON, |body| {
        ControllerParams {
            hsttmo: 30,
            ..ControllerParams::default()
        }
        .write_to(body)
    })?;
    exchange(drive, host, &stcon)?;
    exchange(drive, host, &command_body(2, OP_ONLIN, |_| Ok(()))?)?;

    let buffer = host.data_area();
    let read = command_body(3, OP_READ, |body| {
        Transfer {
            bytecnt: BLOCK_SIZE as u32,
            buffer,
            lba: block,
        }
        .write_to(body)
    })?;
    exchange(drive, host, &read)?;
    Ok(host.sim().read_memory(buffer, BLOCK_SIZE))
}

/// Main run function; returns an exit code.
fn run(args: ArgMatches) -> u8 {
    return match _run(args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };

    fn _run(args: ArgMatches) -> Result<(), CliError> {
        // Ensure that the disk paths exist.
        let disk_a_path = args.get_one::<String>(DISK_A_PATH).unwrap();
        check_disk_path(disk_a_path)?;
        let disk_b_path = args.get_one::<String>(DISK_B_PATH).unwrap();
        check_disk_path(disk_b_path)?;

        // Initialise logging if configured.
        if let Some(log_path) = args.get_one::<String>(LOG_PATH) {
            let logfile =
                File::create(log_path).map_err(|e| format!("Failed to create log file: {}", e))?;
            init_logging(logfile, log_level(args.get_one::<String>(LOG_LEVEL).unwrap()))?;
        }

        let sim = match args.get_one::<String>(BUS).map(String::as_str) {
            Some("unibus") => SimulatedKlesi::new_unibus(MEMORY_SIZE),
            _ => SimulatedKlesi::new_qbus(MEMORY_SIZE),
        };
        let block = *args.get_one::<u32>(BLOCK).unwrap();

        let mut host = HostDriver::new(sim.clone(), HostConfig::default());
        let backends = vec![ImageBackend::new(disk_a_path), ImageBackend::new(disk_b_path)];
        let mut drive = Drive::new(sim, &Config::default(), backends);
        drive.start()?;
        let result = read_block(&mut drive, &mut host, block);
        drive.stop();

        let data = result?;
        println!("Unit 0, block {}:", block);
        print!("{}", pretty_print_hex_block_zero(&data));
        Ok(())
    }
}

fn main() {
    let args = cli().get_matches();
    std::process::exit(run(args).into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }

    #[test]
    fn test_check_disk_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_str().unwrap();
        assert!(check_disk_path(dir).is_ok());

        let file = temp_dir.path().join("file");
        fs::write(&file, b"").unwrap();
        let err = check_disk_path(file.to_str().unwrap()).unwrap_err();
        assert!(err.0.contains("is not a directory"));

        let missing = temp_dir.path().join("missing");
        let err = check_disk_path(missing.to_str().unwrap()).unwrap_err();
        assert!(err.0.starts_with("Could not access"));
    }

    #[test]
    fn test_reads_block_from_image() {
        let disk_a = tempfile::tempdir().unwrap();
        let disk_b = tempfile::tempdir().unwrap();
        let image: Vec<u8> = (0..4 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        fs::write(disk_a.path().join("system.img"), &image).unwrap();

        let sim = SimulatedKlesi::new_unibus(MEMORY_SIZE);
        let mut host = HostDriver::new(sim.clone(), HostConfig::default());
        let backends = vec![ImageBackend::new(disk_a.path()), ImageBackend::new(disk_b.path())];
        let mut drive = Drive::new(sim, &Config::default(), backends);
        drive.start().unwrap();
        let data = read_block(&mut drive, &mut host, 2);
        drive.stop();
        assert_eq!(data.unwrap(), image[2 * BLOCK_SIZE..3 * BLOCK_SIZE]);
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(log_level("TRACE"), LevelFilter::Trace);
        assert_eq!(log_level("Debug"), LevelFilter::Debug);
        assert_eq!(log_level("info"), LevelFilter::Info);
    }
}
