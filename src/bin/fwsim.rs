use clap::{App, Arg, ArgMatches};
use colored::*;
use fwsim::exchange::{LinkState, LinkStats};
use fwsim::fault_injection::FaultInjectionStats;
use fwsim::scheduler::{SchedulerStats, TraceEntry};
use fwsim::{SimConfig, Side, Testbed, TrafficStats, VirtualTime, WireStats};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Serialize)]
struct SideReport {
    side: Side,
    state: LinkState,
    link: LinkStats,
    traffic: TrafficStats,
    wire: WireStats,
    faults: Option<FaultInjectionStats>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    seed: u64,
    duration_ms: u64,
    final_time: VirtualTime,
    scheduler: SchedulerStats,
    sides: Vec<SideReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<TraceEntry>>,
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, String> {
    match matches.value_of(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value for --{}: {}", name, value)),
        None => Ok(None),
    }
}

fn build_config(matches: &ArgMatches) -> Result<SimConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };

    if let Some(seed) = parse_arg(matches, "seed")? {
        config.seed = seed;
    }
    if let Some(duration) = parse_arg(matches, "duration")? {
        config.duration_ms = duration;
    }
    if let Some(size) = parse_arg(matches, "packet-size")? {
        config.packet_size = size;
    }
    if let Some(interval) = parse_arg(matches, "interval")? {
        config.packet_interval_ms = interval;
    }
    if let Some(rate) = parse_arg(matches, "bit-flip-rate")? {
        config.faults.enabled = true;
        config.faults.bit_flip_rate = rate;
    }
    config.validate()?;
    Ok(config)
}

fn print_table(report: &RunReport) {
    println!("{}", "🛰️  FakeWire Link Simulator".bright_blue().bold());
    println!(
        "{} seed {:#x}, ran to {} ({} timers fired)",
        "Run:".bright_white(),
        report.seed,
        report.final_time.to_string().bright_cyan(),
        report.scheduler.total_fired
    );

    for side in &report.sides {
        let state = match side.state {
            LinkState::Operating => format!("{:?}", side.state).bright_green(),
            _ => format!("{:?}", side.state).yellow(),
        };
        println!();
        println!("{} {} {}", "Link".bright_blue().bold(), side.side.label().bold(), state);
        println!(
            "  {} {}  {} {}/{}  {} {}",
            "resets:".bright_white(),
            side.link.resets,
            "handshakes (primary/secondary):".bright_white(),
            side.link.primary_handshakes_sent,
            side.link.secondary_handshakes_sent,
            "codec errors:".bright_white(),
            side.link.codec_errors
        );
        println!(
            "  {} {}  {} {}  {} {}  {} {}",
            "sent:".bright_white(),
            side.link.packets_sent,
            "received:".bright_white(),
            side.link.packets_received,
            "aborted:".bright_white(),
            side.link.packets_aborted,
            "fcts sent:".bright_white(),
            side.link.fcts_sent
        );

        let traffic = &side.traffic;
        let mismatched = if traffic.mismatched == 0 {
            traffic.mismatched.to_string().bright_green()
        } else {
            traffic.mismatched.to_string().bright_red()
        };
        println!(
            "  {} offered {}, delivered {}, lost {}, mismatched {}",
            "traffic:".bright_white(),
            traffic.offered,
            traffic.delivered,
            traffic.lost,
            mismatched
        );
        println!(
            "  {} {} bytes out, {} bytes in",
            "wire:".bright_white(),
            side.wire.bytes_sent,
            side.wire.bytes_received
        );
        if let Some(faults) = &side.faults {
            println!(
                "  {} {} bytes, {} bits flipped, {} controls inserted",
                "faults:".bright_white(),
                faults.bytes_seen,
                faults.bits_flipped,
                faults.controls_inserted
            );
        }
    }

    if let Some(trace) = &report.trace {
        println!();
        println!("{} {} timer firings recorded", "Trace:".bright_white(), trace.len());
        if let (Some(first), Some(last)) = (trace.first(), trace.last()) {
            println!("  first {} at {}, last {} at {}", first.name, first.time, last.name, last.time);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("fwsim")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  FakeWire Link Simulator - deterministic virtual-time link exchange")
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .value_name("SEED")
                .help("Random seed; the same seed replays the same run")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("MS")
                .help("Virtual time to simulate, in milliseconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("packet-size")
                .long("packet-size")
                .value_name("BYTES")
                .help("Largest generated packet")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("MS")
                .help("Gap between generated packets on each side (0 = no traffic)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bit-flip-rate")
                .long("bit-flip-rate")
                .value_name("RATE")
                .help("Per-byte bit flip probability; enables line fault injection")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; flags override its values")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("trace")
                .short("t")
                .long("trace")
                .help("Record every fired timer"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table"),
        )
        .get_matches();

    let config = build_config(&matches)?;
    let record_trace = matches.is_present("trace");

    let mut bed = if record_trace {
        Testbed::with_trace(&config)?
    } else {
        Testbed::new(&config)?
    };
    info!(seed = config.seed, duration_ms = config.duration_ms, "starting run");
    bed.start_traffic();
    let final_time = bed.run_for(Duration::from_millis(config.duration_ms));

    let sides = [Side::A, Side::B]
        .into_iter()
        .map(|side| SideReport {
            side,
            state: bed.link(side).state(),
            link: bed.link_stats(side),
            traffic: bed.traffic_stats(side),
            wire: bed.wire_stats(side),
            faults: bed.fault_stats(side),
        })
        .collect::<Vec<_>>();
    let report = RunReport {
        seed: config.seed,
        duration_ms: config.duration_ms,
        final_time,
        scheduler: bed.sim().get_stats(),
        sides,
        trace: record_trace.then(|| bed.sim().trace()),
    };

    match matches.value_of("format") {
        Some("json") => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }

    let corrupted: u64 = report.sides.iter().map(|side| side.traffic.mismatched).sum();
    if corrupted > 0 && !config.faults.enabled {
        return Err(format!("{} delivered packets failed the integrity check", corrupted).into());
    }
    Ok(())
}
