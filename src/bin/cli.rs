//! Flashboot command line interface.

use std::{
    error::Error as _,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, App, AppSettings::*, Arg,
    ArgMatches, SubCommand,
};
use console::style;
use log::{debug, trace, LevelFilter};
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use simplelog::*;

use flashboot::{
    self as fb, Deployment, DeviceConfig, KernelArtifacts, OsImageArtifacts, ResultLog, RunConfig,
    Services, SessionIo, TargetType,
};

fn main() {
    println!("[FB] flashboot v{}", crate_version!());

    // Session handed back by a run, killed on Ctrl+C. Sessions sharing the
    // terminal are no group leaders.
    let session_pid = Arc::new(AtomicI32::new(0));
    let pid = session_pid.clone();
    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        let pid = Pid::from_raw(pid.load(Ordering::SeqCst));
        if pid.as_raw() > 0 && killpg(pid, Signal::SIGKILL).is_err() {
            let _ = kill(pid, Signal::SIGKILL);
        }
        process::exit(0);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Flashboot deploys images to a test device and boots it. The \
            device is first reset into flash mode, politely over adb, then \
            with the configured hard reset command if it does not answer. \
            The images are then flashed (or a kernel and ramdisk are staged), \
            the device is booted and a session to it is opened: an adb shell \
            or the board's serial console.\n\
            \n\
            All fastboot invocations on the host are serialized through a \
            lock file, so several devices can be handled in parallel by \
            separate flashboot processes.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("CONFIG")
                .help("device configuration file (TOML)")
                .short("-c")
                .long("--config")
                .takes_value(true)
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("BOARD")
                .help("board name, overriding the configuration file")
                .short("-b")
                .long("--board")
                .takes_value(true)
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("SCRATCH_DIR")
                .help("scratch directory of the run")
                .long_help(
                    "scratch directory of the run; downloads land here \
                     unless the device has a shared working directory.",
                )
                .short("-s")
                .long("--scratch-dir")
                .takes_value(true)
                .default_value("/tmp/flashboot")
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("BOOT_CMDS")
                .help("kernel command line, overriding the device boot profiles")
                .long("--boot-cmds")
                .takes_value(true)
                .require_equals(true)
                .global(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help(
                    "Sets the logging level of verbosity, repeat several times for \
                    higher verbosity",
                ),
        )
        .subcommand(
            SubCommand::with_name("android")
                .about("flash an Android image and boot it")
                .arg(url_arg("BOOT", "boot", "boot image").required(true))
                .arg(url_arg("SYSTEM", "system", "system image"))
                .arg(url_arg("USERDATA", "userdata", "userdata image")),
        )
        .subcommand(
            SubCommand::with_name("kernel")
                .about("boot a kernel, with an optional ramdisk and root filesystem")
                .arg(url_arg("KERNEL", "kernel", "kernel image").required(true))
                .arg(url_arg("RAMDISK", "ramdisk", "gzip'ed cpio ramdisk"))
                .arg(url_arg(
                    "MODULES",
                    "modules",
                    "modules tarball, unpacked into the ramdisk",
                ))
                .arg(url_arg(
                    "ROOTFS",
                    "rootfs",
                    "root filesystem image, flashed to the rootfs partition",
                ))
                .arg(
                    Arg::with_name("TARGET")
                        .help("operating system family of the deployment")
                        .long("--target")
                        .takes_value(true)
                        .default_value("linux")
                        .require_equals(true),
                ),
        )
        .subcommand(SubCommand::with_name("boards").about("list the supported boards"))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'flashboot -v -v -v' or 'flashboot -vvv' vs 'flashboot -v'
    let log_level = match verbosity(&matches) {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    trace!("{:#?}", matches);

    let (name, sub) = matches.subcommand();
    let sub = match sub {
        Some(sub) => sub,
        None => unreachable!(),
    };
    if name == "boards" {
        for board in fb::available_boards() {
            println!(
                "{:<16} {:<7} {}",
                style(board.name).cyan(),
                board.family,
                board.description
            );
        }
        return;
    }

    let deployment = match name {
        "android" => Deployment::OsImage(OsImageArtifacts {
            boot: sub.value_of("BOOT").map(String::from),
            system: sub.value_of("SYSTEM").map(String::from),
            userdata: sub.value_of("USERDATA").map(String::from),
        }),
        "kernel" => Deployment::Kernel(KernelArtifacts {
            kernel: sub.value_of("KERNEL").map(String::from),
            ramdisk: sub.value_of("RAMDISK").map(String::from),
            modules: sub.value_of("MODULES").map(String::from),
            rootfs: sub.value_of("ROOTFS").map(String::from),
        }),
        _ => unreachable!(),
    };
    let target: TargetType = match name {
        "android" => TargetType::Android,
        _ => match sub.value_of("TARGET").unwrap().parse() {
            Ok(target) => target,
            Err(never) => match never {},
        },
    };

    // Device and run configuration ============================================

    let config_path = match global_value(&matches, sub, "CONFIG") {
        Some(path) => PathBuf::from(path),
        None => fail_usage("config", "a device configuration file is required"),
    };
    let mut device = DeviceConfig::load(&config_path).unwrap_or_else(|e| fail(&e));
    if let Some(board) = global_value(&matches, sub, "BOARD") {
        device.board = board.to_string();
    }

    // It's safe to call unwrap on arguments with default values.
    let scratch_dir = global_value(&matches, sub, "SCRATCH_DIR").unwrap();
    let mut run = RunConfig::new(target, scratch_dir);
    if let Some(boot_cmds) = global_value(&matches, sub, "BOOT_CMDS") {
        run = run.with_boot_cmds(boot_cmds);
    }
    debug!("{:#?}", device);
    debug!("{:#?}", run);

    // Run the lifecycle =======================================================

    let results = Arc::new(ResultLog::new());
    let services = Services::shell(results.clone(), SessionIo::Inherit);
    let mut driver =
        fb::open_driver(Arc::new(device), run, services).unwrap_or_else(|e| fail(&e));

    let outcome = fb::dispatch(driver.as_mut(), &deployment);
    for (name, status) in results.entries() {
        println!("[FB] {}: {}", name, status);
    }
    let mut session = outcome.unwrap_or_else(|e| fail(&e));
    if let Some(pid) = session.id() {
        session_pid.store(pid as i32, Ordering::SeqCst);
    }

    println!(
        "{} connected through `{}`",
        style("[FB]").green(),
        style(session.command()).cyan()
    );
    let exit_code = session.wait().unwrap_or_else(|e| fail(&e));
    debug!("session exit code: {:?}", exit_code);
    process::exit(exit_code.unwrap_or(0));
}

fn url_arg<'a>(name: &'a str, long: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .help(help)
        .long(long)
        .takes_value(true)
        .value_name("URL")
        .require_equals(true)
}

/// Global arguments may be given before or after the subcommand.
fn global_value<'a>(
    matches: &'a ArgMatches<'a>,
    sub: &'a ArgMatches<'a>,
    name: &str,
) -> Option<&'a str> {
    if sub.occurrences_of(name) > 0 {
        sub.value_of(name)
    } else {
        matches.value_of(name).or_else(|| sub.value_of(name))
    }
}

fn verbosity(matches: &ArgMatches) -> u64 {
    let sub = matches.subcommand().1.map_or(0, |sub| sub.occurrences_of("v"));
    matches.occurrences_of("v").max(sub)
}

fn fail_usage(arg: &str, message: &str) -> ! {
    println!(
        "{}: `{}` {}",
        style("error").red(),
        style(arg).cyan(),
        message
    );
    process::exit(-1);
}

fn fail(error: &fb::Error) -> ! {
    println!("{}: {}", style("error").red(), error);
    let mut source = error.source();
    while let Some(cause) = source {
        println!("   {} {}", style("-->").cyan(), cause);
        source = cause.source();
    }
    process::exit(1);
}
