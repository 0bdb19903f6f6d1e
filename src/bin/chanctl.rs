/// Manual control harness for the emulated channel devices this crate
/// implements.
///
/// This is not a channel subsystem: each invocation builds one fresh
/// [`chandev::device::DeviceContext`], mounts a tape (or parses a HIM
/// configuration string) and executes a single operation against it, then
/// prints the resulting status, residual and sense bytes. It exists to
/// poke the engine by hand while developing against it, the same role
/// `pmt` plays for `pbs-tape`'s `SgTape` -- simplified to plain
/// `std::env::args` parsing since the teacher's `proxmox-router`/
/// `proxmox-schema` API-macro CLI framework has no counterpart here (see
/// DESIGN.md).
///
/// Usage:
///
/// ```text
/// chanctl mount <device-type-hex> <mount-arg>...
/// chanctl ccw <device-type-hex> <opcode-name> [count] -- <mount-arg>...
/// chanctl him-config <ascii-config-string>
/// ```
use std::env;

use anyhow::{bail, Context, Error};

use chandev::ccw::{self, CcwRequest};
use chandev::device::DeviceContext;
use chandev::him::config::{encode_ebcdic, parse_config_string};
use chandev::tape::TapeState;
use chandev::validity::opcode;

fn parse_device_type(s: &str) -> Result<u16, Error> {
    let s = s.trim_start_matches("0x");
    u16::from_str_radix(s, 16).with_context(|| format!("bad device type {s:?}, expected hex"))
}

/// Map a mnemonic the way a human would type it on a command line to the
/// matching CCW opcode (spec.md §4.2).
fn opcode_by_name(name: &str) -> Result<u8, Error> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "write" => opcode::WRITE,
        "read" | "read-forward" => opcode::READ_FORWARD,
        "read-backward" => opcode::READ_BACKWARD,
        "nop" => opcode::NOP,
        "sense" => opcode::SENSE,
        "sense-id" => opcode::SENSE_ID,
        "rewind" => opcode::REWIND,
        "rewind-unload" => opcode::REWIND_UNLOAD,
        "write-tapemark" | "wtm" => opcode::WRITE_TAPEMARK,
        "erase-gap" => opcode::ERASE_GAP,
        "fsb" => opcode::FORWARD_SPACE_BLOCK,
        "bsb" => opcode::BACKWARD_SPACE_BLOCK,
        "fsf" => opcode::FORWARD_SPACE_FILE,
        "bsf" => opcode::BACKWARD_SPACE_FILE,
        "dse" => opcode::DATA_SECURITY_ERASE,
        "sync" => opcode::SYNC,
        "load-display" => opcode::LOAD_DISPLAY,
        "mode-set" => opcode::MODE_SET,
        "assign" => opcode::ASSIGN,
        "unassign" => opcode::UNASSIGN,
        "control-access" => opcode::CONTROL_ACCESS,
        other => bail!("unknown opcode mnemonic {other:?}"),
    })
}

fn mount_context(device_type: u16, argv: &[String]) -> Result<DeviceContext, Error> {
    let mut tape = TapeState::new();
    tape.mount(argv).context("mount")?;
    Ok(DeviceContext::new_tape(device_type, 0, tape))
}

fn print_result(ctx: &DeviceContext, residual: u32) {
    println!("unit_status = {:?}", ctx.unit_status);
    println!("residual    = {residual}");
    if !ctx.sense.is_empty() {
        println!("sense       = {}", hex::encode(&ctx.sense));
    }
}

fn cmd_mount(args: &[String]) -> Result<(), Error> {
    let (device_type, argv) = args.split_first().context("mount: missing device type")?;
    let device_type = parse_device_type(device_type)?;
    if argv.is_empty() {
        bail!("mount: missing mount argument vector");
    }
    let ctx = mount_context(device_type, argv)?;
    let tape = ctx.tape().expect("tape context");
    println!("mounted {:?} on device type {:#06x}", tape.filename, device_type);
    println!("loaded      = {}", tape.is_loaded());
    println!("read_only   = {}", tape.read_only);
    Ok(())
}

fn cmd_ccw(args: &[String]) -> Result<(), Error> {
    let split = args.iter().position(|a| a == "--").context("ccw: missing `--` before mount arguments")?;
    let (head, rest) = args.split_at(split);
    let mount_argv = &rest[1..];
    if mount_argv.is_empty() {
        bail!("ccw: missing mount argument vector after `--`");
    }

    let mut head = head.iter();
    let device_type = parse_device_type(head.next().context("ccw: missing device type")?)?;
    let opcode = opcode_by_name(head.next().context("ccw: missing opcode mnemonic")?)?;
    let count: u16 = match head.next() {
        Some(s) => s.parse().context("ccw: bad count")?,
        None => 0,
    };

    let mut ctx = mount_context(device_type, mount_argv)?;
    let req = CcwRequest {
        opcode,
        chained: false,
        count,
        prev_opcode: 0,
        ccw_seq: 0,
    };
    ctx.buffer = vec![0u8; count as usize];
    let result = ccw::execute(&mut ctx, &req);
    print_result(&ctx, result.residual);
    Ok(())
}

fn cmd_him_config(args: &[String]) -> Result<(), Error> {
    let ascii = args.join(" ");
    if ascii.is_empty() {
        bail!("him-config: missing configuration string");
    }
    let ebcdic = encode_ebcdic(&ascii);
    let parsed = parse_config_string(&ebcdic)?;
    println!("{parsed:#?}");
    Ok(())
}

fn run() -> Result<(), Error> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        bail!("usage: chanctl <mount|ccw|him-config> ...");
    }
    let cmd = args.remove(0);
    match cmd.as_str() {
        "mount" => cmd_mount(&args),
        "ccw" => cmd_ccw(&args),
        "him-config" => cmd_him_config(&args),
        other => bail!("unknown subcommand {other:?}"),
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("chanctl: {err:#}");
        std::process::exit(1);
    }
}
