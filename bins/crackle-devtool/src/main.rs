use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use crackle_core::{decompose, Decomposition};
use crackle_md5::{num_tasks, Charset, MAX_NCHARS};
use crackle_utils::{bytes_to_hex, md5_digest};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crackle-devtool", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the MD5 sum of a string
    Digest { text: String },
    /// Preview how a task space splits across participants
    Plan {
        #[arg(long)]
        tasks: u64,
        /// Per-participant capacities, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        capacity: Vec<u64>,
        #[arg(long, default_value_t = 1)]
        multiplier: u32,
        #[arg(long)]
        json: bool,
    },
    /// Size the search space of a crack
    Keyspace {
        #[arg(long, default_value_t = Charset::Alnum)]
        charset: Charset,
        #[arg(long, default_value_t = MAX_NCHARS)]
        nchars: u8,
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[derive(Serialize)]
struct PlanView {
    num_tasks: u64,
    multiplier: u32,
    num_rounds: u64,
    ranges: Vec<RangeView>,
}

#[derive(Serialize)]
struct RangeView {
    rank: usize,
    capacity: u64,
    start: u64,
    end: u64,
    len: u64,
}

fn plan_view(num_tasks: u64, caps: &[u64], multiplier: u32, plan: &Decomposition) -> PlanView {
    PlanView {
        num_tasks,
        multiplier,
        num_rounds: plan.num_rounds,
        ranges: plan
            .ranges
            .iter()
            .zip(caps)
            .enumerate()
            .map(|(rank, (r, &capacity))| RangeView {
                rank,
                capacity,
                start: r.start,
                end: r.end,
                len: r.len(),
            })
            .collect(),
    }
}

fn keyspace_size(charset: Charset, nchars: u8, prefix: &str) -> Result<u64> {
    if nchars == 0 || nchars > MAX_NCHARS {
        bail!("nchars must be between 1 and {MAX_NCHARS}");
    }
    match num_tasks(charset, nchars, prefix.len()) {
        Some(0) => bail!("prefix `{prefix}` already fills {nchars} characters"),
        Some(n) => Ok(n),
        None => bail!("keyspace does not fit in 64 bits"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).init();
    let cli = Cli::parse();
    debug!(?cli, "devtool");

    match cli.cmd {
        Cmd::Digest { text } => println!("{}", bytes_to_hex(&md5_digest(text.as_bytes()))),
        Cmd::Plan { tasks, capacity, multiplier, json } => {
            let plan = decompose(tasks, &capacity, multiplier)?;
            let view = plan_view(tasks, &capacity, multiplier, &plan);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                println!("tasks {} multiplier {} rounds {}", view.num_tasks, view.multiplier, view.num_rounds);
                for r in &view.ranges {
                    println!(
                        "rank {:>3}  capacity {:>8}  [{}, {})  {} tasks",
                        r.rank, r.capacity, r.start, r.end, r.len
                    );
                }
            }
        }
        Cmd::Keyspace { charset, nchars, prefix } => {
            let n = keyspace_size(charset, nchars, &prefix)?;
            println!("charset {charset} ({} symbols), {nchars} chars, prefix `{prefix}`: {n} candidates", charset.size());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_view_lists_every_rank() {
        let caps = [4, 8, 4];
        let plan = decompose(100, &caps, 1).unwrap();
        let view = plan_view(100, &caps, 1, &plan);
        assert_eq!(view.ranges.len(), 3);
        assert_eq!(view.ranges.iter().map(|r| r.len).sum::<u64>(), 100);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["ranges"][2]["end"], 100);
    }

    #[test]
    fn keyspace_size_checks_bounds() {
        assert_eq!(keyspace_size(Charset::Digit, 4, "1").unwrap(), 1000);
        assert!(keyspace_size(Charset::Digit, 2, "12").is_err());
        assert!(keyspace_size(Charset::Digit, 9, "").is_err());
    }

    #[test]
    fn capacities_parse_comma_separated() {
        let cli = Cli::try_parse_from(["crackle-devtool", "plan", "--tasks", "10", "--capacity", "3,5"]).unwrap();
        match cli.cmd {
            Cmd::Plan { capacity, multiplier, .. } => {
                assert_eq!(capacity, vec![3, 5]);
                assert_eq!(multiplier, 1);
            }
            _ => panic!("expected plan"),
        }
    }
}
