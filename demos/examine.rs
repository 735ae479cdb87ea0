extern crate clap;
extern crate env_logger;
extern crate mdraid_core;
extern crate unbytify;

use clap::{App, Arg};
use mdraid_core::blockdev::{BlockDevice, File};
use mdraid_core::device::MemberDevice;
use mdraid_core::superblock::{Format, Superblock};
use std::process;

fn examine(path: &str, format: Format, minor: u32) -> Option<Superblock> {
    let file = match File::open(path, true) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            process::exit(1);
        }
    };
    let mut dev = MemberDevice::new(Box::new(file));
    match format.load_super(&mut dev, None, minor) {
        Ok(_) => dev.superblock().cloned(),
        Err(e) => {
            log::debug!("{}: no {} superblock (minor {}): {}", path, format.name(), minor, e);
            None
        }
    }
}

fn uuid(bytes: [u8; 16]) -> String {
    bytes
        .chunks(4)
        .map(|c| c.iter().map(|b| format!("{:02x}", b)).collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

fn main() {
    env_logger::init();
    let matches = App::new("examine")
        .about("Prints the RAID superblock of a device or image file")
        .arg(
            Arg::with_name("DEVICE")
                .required(true)
                .multiple(true)
                .help("Devices or files to examine"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Dump the full superblock"),
        )
        .get_matches();
    let verbose = matches.is_present("verbose");

    let candidates = [
        (Format::V1, 2),
        (Format::V1, 1),
        (Format::V1, 0),
        (Format::V090, 90),
    ];
    let mut missing = false;
    for path in matches.values_of("DEVICE").into_iter().flatten() {
        let found = candidates
            .iter()
            .filter_map(|&(format, minor)| examine(path, format, minor).map(|sb| (format, minor, sb)))
            .next();
        match found {
            Some((format, minor, sb)) => {
                let size = File::open(path, true).map(|f| f.size().to_bytes()).unwrap_or(0);
                let (size, suffix) = unbytify::bytify(size);
                println!("{}:", path);
                println!("    format  {} (minor {})", format.name(), minor);
                println!("    size    {:.1} {}", size, suffix);
                println!("    uuid    {}", uuid(sb.uuid()));
                println!("    level   {}", sb.level());
                println!("    events  {}", sb.events());
                if verbose {
                    println!("{:#?}", sb);
                }
            }
            None => {
                println!("{}: no superblock found", path);
                missing = true;
            }
        }
    }
    if missing {
        process::exit(2);
    }
}
