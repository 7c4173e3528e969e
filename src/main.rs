use std::fs::File;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use serde_derive::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use u2f_compliance::u2f::client::token::SoftToken;
use u2f_compliance::u2f::client::{ComplianceSuite, FailurePolicy, SuiteConfig, SuiteReport, Unattended};
use u2f_compliance::u2f::error::Error;
use u2f_compliance::u2f::hid_proto::{HidTransport, VirtualHidToken};
use u2f_compliance::u2f::transport::{ApduTransport, TransportConfig};

const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    transport: TransportConfig,
    suite: SuiteConfig,
}

// Global flags may land on either the top level or the sub-command.
fn flag(matches: &ArgMatches, name: &str) -> bool {
    matches.is_present(name) || matches.subcommand().1.map_or(false, |sub| sub.is_present(name))
}

fn value<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a str> {
    matches
        .value_of(name)
        .or_else(|| matches.subcommand().1.and_then(|sub| sub.value_of(name)))
}

fn init_logging(matches: &ArgMatches) {
    let level = if flag(matches, "trace") {
        "trace"
    } else if flag(matches, "verbose") {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(matches: &ArgMatches) -> Result<RunConfig, Error> {
    let mut config = match value(matches, "config") {
        Some(path) => serde_json::from_reader(File::open(path)?)?,
        None => RunConfig::default(),
    };

    if flag(matches, "continue") {
        config.suite.failure_policy = FailurePolicy::Continue;
    }
    if flag(matches, "pause") {
        config.suite.pause = true;
    }
    if flag(matches, "trace") {
        config.suite.log_crypto = true;
    }
    if let Some(block_size) = value(matches, "block-size") {
        config.transport.block_size = block_size
            .parse()
            .map_err(|_| Error::Config(format!("invalid block size {:?}", block_size)))?;
    }

    config.transport.validate()?;
    Ok(config)
}

fn finish<T: u2f_compliance::u2f::transport::RawTransport>(name: &str, mut suite: ComplianceSuite<T>, res: Result<(), Error>) -> SuiteReport {
    if let Err(e) = res {
        error!("{} suite stopped: {}", name, e);
        if !matches!(e, Error::Aborted(_)) {
            let _ = suite.check::<()>(name, Err(e));
        }
    }
    suite.into_report()
}

fn self_test(config: &RunConfig) -> Result<Vec<SuiteReport>, Error> {
    let suite_config = SuiteConfig {
        has_button: false,
        ..config.suite.clone()
    };

    let transport = ApduTransport::open(SoftToken::simple()?, config.transport.clone())?;
    let mut nfc = ComplianceSuite::new(transport, suite_config.clone(), Unattended);
    let res = nfc.run_nfc();
    let nfc_report = finish("NFC", nfc, res);

    let hid = HidTransport::new(VirtualHidToken::new(SoftToken::simple()?));
    let transport = ApduTransport::open(hid, config.transport.clone())?;
    let mut hid = ComplianceSuite::new(transport, suite_config, Unattended);
    let res = hid.run_hid();
    let hid_report = finish("HID", hid, res);

    Ok(vec![nfc_report, hid_report])
}

#[cfg(feature = "nfc")]
fn run_nfc(config: &RunConfig, matches: &ArgMatches) -> Result<Vec<SuiteReport>, Error> {
    use u2f_compliance::u2f::transport::pcsc::PcscReader;

    if matches.is_present("list") {
        for reader in PcscReader::list_readers()? {
            info!("{}", reader);
        }
        return Ok(Vec::new());
    }

    let reader = PcscReader::new(matches.value_of("reader"))?;
    let transport = ApduTransport::open(reader, config.transport.clone())?;
    let mut suite = ComplianceSuite::new(transport, config.suite.clone(), operator());
    let res = suite.run_nfc();
    Ok(vec![finish("NFC", suite, res)])
}

#[cfg(not(feature = "nfc"))]
fn run_nfc(_config: &RunConfig, _matches: &ArgMatches) -> Result<Vec<SuiteReport>, Error> {
    Err(Error::Config("built without the `nfc` feature".to_string()))
}

#[cfg(feature = "usb-hid")]
fn run_hid(config: &RunConfig, matches: &ArgMatches) -> Result<Vec<SuiteReport>, Error> {
    use u2f_compliance::u2f::transport::hidapi::{list_devices, HidApiDevice};

    let path = match matches.value_of("device") {
        Some(path) => path.to_string(),
        None => {
            for path in list_devices()? {
                info!("{}", path);
            }
            return Ok(Vec::new());
        }
    };

    let suite_config = SuiteConfig {
        has_button: !matches.is_present("no-button"),
        ..config.suite.clone()
    };

    let hid = HidTransport::new(HidApiDevice::open(&path)?);
    let transport = ApduTransport::open(hid, config.transport.clone())?;
    let mut suite = ComplianceSuite::new(transport, suite_config, operator());
    let res = suite.run_hid();
    Ok(vec![finish("HID", suite, res)])
}

#[cfg(not(feature = "usb-hid"))]
fn run_hid(_config: &RunConfig, _matches: &ArgMatches) -> Result<Vec<SuiteReport>, Error> {
    Err(Error::Config("built without the `usb-hid` feature".to_string()))
}

#[cfg(any(feature = "nfc", feature = "usb-hid"))]
fn operator() -> u2f_compliance::u2f::client::ConsoleOperator {
    u2f_compliance::u2f::client::ConsoleOperator
}

fn run(matches: &ArgMatches) -> Result<bool, Error> {
    let config = load_config(matches)?;

    let reports = match matches.subcommand() {
        ("nfc", Some(sub)) => run_nfc(&config, sub)?,
        ("hid", Some(sub)) => run_hid(&config, sub)?,
        ("self-test", Some(_)) => self_test(&config)?,
        _ => return Err(Error::Config("no sub-command given".to_string())),
    };

    let mut success = true;
    for report in &reports {
        info!(
            "{} passed, {} failed, {} slow transactions",
            report.passed,
            report.failed.len(),
            report.latency_violations
        );
        for failure in &report.failed {
            error!("  {}", failure);
        }
        success &= report.is_success();
    }

    Ok(success)
}

fn main() {
    let matches = App::new("U2F compliance tester")
        .version(VERSION)
        .author(AUTHORS)
        .about(DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("verbose").short("v").global(true).help("Log APDUs"))
        .arg(Arg::with_name("trace").short("V").global(true).help("Log APDUs, HID frames and crypto values"))
        .arg(Arg::with_name("continue").short("a").global(true).help("Keep going after a failed check"))
        .arg(Arg::with_name("pause").short("p").global(true).help("Wait for enter after a failed check"))
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .takes_value(true)
                .global(true)
                .help("JSON file with `transport` and `suite` settings"),
        )
        .arg(
            Arg::with_name("block-size")
                .long("block-size")
                .value_name("BYTES")
                .takes_value(true)
                .global(true)
                .help("Short APDU chain block size, 1 to 256"),
        )
        .subcommand(
            SubCommand::with_name("nfc")
                .about("Test a token through a PC/SC reader")
                .arg(Arg::with_name("reader").long("reader").value_name("NAME").takes_value(true).help("Reader name, first reader otherwise"))
                .arg(Arg::with_name("list").long("list").help("List readers and exit")),
        )
        .subcommand(
            SubCommand::with_name("hid")
                .about("Test a token over USB HID, lists devices when no path is given")
                .arg(Arg::with_name("device").value_name("PATH").index(1))
                .arg(Arg::with_name("no-button").short("b").help("The token has no button")),
        )
        .subcommand(SubCommand::with_name("self-test").about("Run both suites against the built-in soft token"))
        .get_matches();

    init_logging(&matches);

    match run(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    }
}
