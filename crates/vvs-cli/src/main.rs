#![forbid(unsafe_code)]
//! Line-oriented driver shell for the virtual-volume simulator.
//!
//! Each stdin line is whitespace-separated tokens; the first token is a
//! decimal opcode, numeric operands accept hexadecimal (`0x…`) or
//! decimal. EOF exits cleanly; a malformed line is fatal.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write as _};
use tracing_subscriber::EnvFilter;
use vvs_engine::VvEngine;
use vvs_error::VvsError;
use vvs_types::{BlockAddr, Tte, VvId};

#[derive(Parser)]
#[command(name = "vvs", about = "virtual-volume address-translation and snapshot simulator")]
struct Cli {
    /// Suppress the interactive prompt banner (for piped command scripts).
    #[arg(long)]
    quiet: bool,
    /// Emit volume listings and TTE dumps as JSON.
    #[arg(long)]
    json: bool,
    /// Audit translation-tree invariants after every mutating command.
    #[arg(long)]
    audit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Write {
        vv: VvId,
        addr: BlockAddr,
        len: u64,
        val: Tte,
    },
    Read {
        vv: VvId,
        addr: BlockAddr,
        len: u64,
    },
    CreateSnapshot {
        name: String,
    },
    DeleteSnapshot {
        name: String,
    },
    ListVolumes,
    DumpTtes,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut engine = VvEngine::new();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        if !cli.quiet {
            print_prompt()?;
        }
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("read command line")?;
        let command = parse_line(&line)?;
        execute(&mut engine, &command, &cli)?;
    }
    Ok(())
}

fn print_prompt() -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out)?;
    writeln!(out, "write    : 1 <vvid> <addr> <len> <val>")?;
    writeln!(out, "read     : 2 <vvid> <addr> <len>")?;
    writeln!(out, "snap     : 3 <name>")?;
    writeln!(out, "delsnap  : 4 <name>")?;
    writeln!(out, "volumes  : 5")?;
    writeln!(out, "dump     : 6")?;
    write!(out, ">>> ")?;
    out.flush()?;
    Ok(())
}

// ── Command grammar ─────────────────────────────────────────────────────

/// Parse one numeric operand, accepting `0x…` hexadecimal or decimal.
fn parse_num(token: &str) -> Result<u64, VvsError> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| VvsError::BadNumber {
            token: token.to_owned(),
            reason: "expected hexadecimal digits after 0x",
        });
    }
    token.parse().map_err(|_| VvsError::BadNumber {
        token: token.to_owned(),
        reason: "expected a decimal integer",
    })
}

fn parse_vvid(token: &str) -> Result<VvId, VvsError> {
    let raw = parse_num(token)?;
    u32::try_from(raw)
        .map(VvId)
        .map_err(|_| VvsError::NoSuchVolume(raw))
}

fn parse_line(line: &str) -> Result<Command, VvsError> {
    let mut tokens = line.split_whitespace();
    let first = tokens
        .next()
        .ok_or(VvsError::MalformedCommand("empty command line"))?;
    let opcode: u64 = first.parse().map_err(|_| VvsError::BadNumber {
        token: first.to_owned(),
        reason: "opcode must be a decimal integer",
    })?;

    let mut operand =
        |missing: &'static str| tokens.next().ok_or(VvsError::MalformedCommand(missing));

    match opcode {
        1 => Ok(Command::Write {
            vv: parse_vvid(operand("write needs <vvid>")?)?,
            addr: BlockAddr(parse_num(operand("write needs <addr>")?)?),
            len: parse_num(operand("write needs <len>")?)?,
            val: Tte(parse_num(operand("write needs <val>")?)?),
        }),
        2 => Ok(Command::Read {
            vv: parse_vvid(operand("read needs <vvid>")?)?,
            addr: BlockAddr(parse_num(operand("read needs <addr>")?)?),
            len: parse_num(operand("read needs <len>")?)?,
        }),
        3 => Ok(Command::CreateSnapshot {
            name: operand("snap needs <name>")?.to_owned(),
        }),
        4 => Ok(Command::DeleteSnapshot {
            name: operand("delsnap needs <name>")?.to_owned(),
        }),
        5 => Ok(Command::ListVolumes),
        6 => Ok(Command::DumpTtes),
        other => Err(VvsError::BadOpcode(other)),
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

fn execute(engine: &mut VvEngine, command: &Command, cli: &Cli) -> Result<()> {
    match command {
        Command::Write { vv, addr, len, val } => {
            engine.write(*vv, *addr, *len, *val)?;
            println!("wrote vv {} addr {:#x} tte {:#x}", vv, addr.0, val.0);
            audit(engine, cli)?;
        }
        Command::Read { vv, addr, len } => {
            let tte = engine.read(*vv, *addr, *len)?;
            println!("vv {} addr {:#x} -> tte {:#x}", vv, addr.0, tte.0);
        }
        Command::CreateSnapshot { name } => {
            let id = engine.create_snapshot(name)?;
            println!("snapshot {name:?} created as vv {id}");
            audit(engine, cli)?;
        }
        Command::DeleteSnapshot { name } => {
            let id = engine.delete_snapshot(name)?;
            println!("snapshot {name:?} deleted (was vv {id})");
            audit(engine, cli)?;
        }
        Command::ListVolumes => {
            let volumes = engine.list_volumes();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&volumes)?);
            } else {
                for vol in &volumes {
                    println!("{:>8} : {}", "Id", vol.id);
                    println!("{:>8} : {}", "Name", vol.name);
                    println!("{:>8} : {}", "Child", vol.child);
                    println!("{:>8} : {}", "Parent", vol.parent);
                    println!();
                }
            }
        }
        Command::DumpTtes => {
            let mappings = engine.dump_mappings()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else if !mappings.is_empty() {
                println!(
                    "{:>6} {:>6} {:>8} {:>8} {:>8} {:>16}",
                    "VvId", "Bank", "L1", "L2", "L3", "Tte"
                );
                for m in &mappings {
                    println!(
                        "{:>6} {:>6} {:>8} {:>8} {:>8} {:>16}",
                        m.vv,
                        m.bank,
                        format!("{:#x}", m.l1),
                        format!("{:#x}", m.l2),
                        format!("{:#x}", m.l3),
                        format!("{:#x}", m.tte.0),
                    );
                }
            }
        }
    }
    Ok(())
}

fn audit(engine: &VvEngine, cli: &Cli) -> Result<()> {
    if cli.audit {
        engine.check_invariants()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_accept_hex_and_decimal() {
        assert_eq!(parse_num("0x10000").expect("hex"), 0x10000);
        assert_eq!(parse_num("0XAAAA").expect("hex upper prefix"), 0xAAAA);
        assert_eq!(parse_num("1234").expect("decimal"), 1234);
        assert!(parse_num("0x").is_err());
        assert!(parse_num("12g4").is_err());
        assert!(parse_num("").is_err());
    }

    #[test]
    fn write_command_parses_all_operands() {
        assert_eq!(
            parse_line("1 1 0x10000 0x1000 0xAAAA").expect("parse"),
            Command::Write {
                vv: VvId(1),
                addr: BlockAddr(0x10000),
                len: 0x1000,
                val: Tte(0xAAAA),
            }
        );
    }

    #[test]
    fn read_snapshot_and_listing_commands_parse() {
        assert_eq!(
            parse_line("2 2 0x0 0x1000").expect("parse"),
            Command::Read {
                vv: VvId(2),
                addr: BlockAddr(0),
                len: 0x1000,
            }
        );
        assert_eq!(
            parse_line("3 snap1").expect("parse"),
            Command::CreateSnapshot {
                name: "snap1".to_owned()
            }
        );
        assert_eq!(
            parse_line("4 snap1").expect("parse"),
            Command::DeleteSnapshot {
                name: "snap1".to_owned()
            }
        );
        assert_eq!(parse_line("5").expect("parse"), Command::ListVolumes);
        assert_eq!(parse_line(" 6 ").expect("parse"), Command::DumpTtes);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(
            parse_line("").expect_err("empty"),
            VvsError::MalformedCommand("empty command line")
        );
        assert!(matches!(
            parse_line("read 1 0 0").expect_err("non-numeric opcode"),
            VvsError::BadNumber { .. }
        ));
        assert_eq!(
            parse_line("7").expect_err("unknown opcode"),
            VvsError::BadOpcode(7)
        );
        assert_eq!(
            parse_line("1 1 0x0").expect_err("missing operands"),
            VvsError::MalformedCommand("write needs <len>")
        );
        assert_eq!(
            parse_line("3").expect_err("missing name"),
            VvsError::MalformedCommand("snap needs <name>")
        );
        assert!(matches!(
            parse_line("2 1 zzz 0").expect_err("bad operand"),
            VvsError::BadNumber { .. }
        ));
    }

    #[test]
    fn opcode_must_be_decimal() {
        assert!(matches!(
            parse_line("0x2 1 0 0").expect_err("hex opcode"),
            VvsError::BadNumber { .. }
        ));
    }
}
