use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use diskgraph::apps::msf::MstEdge;
use diskgraph::apps::{bfs, connected_components, msf};
use diskgraph::config::Config;
use diskgraph::error::{Error, Result};
use diskgraph::filenames;
use diskgraph::preprocessing::Sharder;
use diskgraph::types::{FixedWidth, VId};
use itertools::Itertools;
use std::io::{BufRead, BufReader};
use std::path::Path;

fn graph_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("file")
            .long("file")
            .takes_value(true)
            .required(true)
            .help("Edge list file; shard files are derived from this path"),
    )
    .arg(
        Arg::with_name("nshards")
            .long("nshards")
            .takes_value(true)
            .default_value("auto"),
    )
    .arg(
        Arg::with_name("membudget_mb")
            .long("membudget_mb")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("execthreads")
            .long("execthreads")
            .takes_value(true),
    )
    .arg(
        Arg::with_name("niothreads")
            .long("niothreads")
            .takes_value(true),
    )
}

fn config_from(matches: &ArgMatches) -> Config {
    let mut config = Config::new();
    for key in &["membudget_mb", "execthreads", "niothreads"] {
        if let Some(value) = matches.value_of(key) {
            config.set(*key, value);
        }
    }
    config
}

/// Creates shards from a text edge list (`src dst [value]` per line)
/// unless a matching shard set already exists.
fn shard_if_missing<E: FixedWidth>(
    base: &str,
    nshards_spec: &str,
    config: &Config,
) -> Result<usize> {
    if let Ok(explicit) = nshards_spec.parse::<usize>() {
        if filenames::shards_exist(base, explicit) {
            log::info!("found existing shards for {} ({})", base, explicit);
            return Ok(explicit);
        }
    } else if let Some(found) = filenames::find_nshards(base) {
        log::info!("found existing shards for {} ({})", base, found);
        return Ok(found);
    }

    let file = std::fs::File::open(base).map_err(|e| Error::io(e, Path::new(base)))?;
    let mut sharder: Sharder<E> = Sharder::new(base, config);
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(e, Path::new(base)))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let src: VId = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Config(format!("malformed edge line: {}", line)))?;
        let dst: VId = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Config(format!("malformed edge line: {}", line)))?;
        let value = fields
            .next()
            .and_then(E::parse_text)
            .unwrap_or_default();
        sharder.add_edge_with_value(src, dst, value)?;
    }
    sharder.execute_sharding(nshards_spec)
}

fn handle_shard(matches: &ArgMatches) -> Result<()> {
    let base = matches.value_of("file").unwrap();
    let config = config_from(matches);
    let nshards = shard_if_missing::<f32>(base, matches.value_of("nshards").unwrap(), &config)?;
    println!("created {} shards for {}", nshards, base);
    Ok(())
}

fn handle_cc(matches: &ArgMatches) -> Result<()> {
    let base = matches.value_of("file").unwrap();
    let niters: u32 = matches.value_of("niters").unwrap_or("100").parse().unwrap_or(100);
    let config = config_from(matches);
    let nshards = shard_if_missing::<connected_components::BiLabel>(
        base,
        matches.value_of("nshards").unwrap(),
        &config,
    )?;
    let labels = connected_components::run(base, nshards, niters, &config)?;
    println!(
        "{} vertices in {} components",
        labels.len(),
        labels.iter().unique().count()
    );
    Ok(())
}

fn handle_bfs(matches: &ArgMatches) -> Result<()> {
    let base = matches.value_of("file").unwrap();
    let root: VId = matches.value_of("root").unwrap_or("0").parse().unwrap_or(0);
    let niters: u32 = matches.value_of("niters").unwrap_or("100").parse().unwrap_or(100);
    let config = config_from(matches);
    let nshards =
        shard_if_missing::<u32>(base, matches.value_of("nshards").unwrap(), &config)?;
    let distances = bfs::run(base, nshards, root, niters, &config)?;
    let reached = distances.iter().filter(|&&d| d != bfs::UNREACHED).count();
    let eccentricity = distances
        .iter()
        .filter(|&&d| d != bfs::UNREACHED)
        .max()
        .unwrap_or(&0);
    println!(
        "reached {} of {} vertices from {}; eccentricity {}",
        reached,
        distances.len(),
        root,
        eccentricity
    );
    Ok(())
}

fn handle_msf(matches: &ArgMatches) -> Result<()> {
    let base = matches.value_of("file").unwrap();
    let config = config_from(matches);
    let nshards =
        shard_if_missing::<MstEdge>(base, matches.value_of("nshards").unwrap(), &config)?;
    let total = msf::run(base, nshards, &config)?;
    println!("minimum spanning forest weight {}; edges in {}.mst", total, base);
    Ok(())
}

fn main() {
    env_logger::init();
    let matches = App::new("diskgraph")
        .about("Disk-based vertex-centric graph computation")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(graph_args(
            SubCommand::with_name("shard").about("Preprocess an edge list into shards"),
        ))
        .subcommand(
            graph_args(SubCommand::with_name("cc").about("Connected components")).arg(
                Arg::with_name("niters")
                    .long("niters")
                    .takes_value(true)
                    .default_value("100"),
            ),
        )
        .subcommand(
            graph_args(SubCommand::with_name("bfs").about("Breadth-first search"))
                .arg(Arg::with_name("root").long("root").takes_value(true).default_value("0"))
                .arg(
                    Arg::with_name("niters")
                        .long("niters")
                        .takes_value(true)
                        .default_value("100"),
                ),
        )
        .subcommand(graph_args(
            SubCommand::with_name("msf").about("Minimum spanning forest"),
        ))
        .get_matches();

    let result = match matches.subcommand() {
        ("shard", Some(matches)) => handle_shard(matches),
        ("cc", Some(matches)) => handle_cc(matches),
        ("bfs", Some(matches)) => handle_bfs(matches),
        ("msf", Some(matches)) => handle_msf(matches),
        _ => unreachable!(),
    };
    if let Err(error) = result {
        log::error!("{}", error);
        std::process::exit(1);
    }
}
