use anyhow::bail;
use argh::FromArgs;
use hartsim::RunOutcome;
use hartsim::Simulator;
use hartsim::Xlen;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;

#[derive(FromArgs)]
/// Simulate a single RISC-V RV32IMC/RV64IMC hart
struct Args {
    /// register width in bits, 32 or 64 (default 64)
    #[argh(option, short = 'x', default = "64")]
    xlen: u32,

    /// memory size in megabytes (default 256)
    #[argh(option, short = 'm')]
    memory_megs: Option<usize>,

    /// write a trace of retired instructions to this file
    #[argh(option, short = 't')]
    trace_file: Option<String>,

    /// trace retired instructions to stdout
    #[argh(switch, short = 'v')]
    trace: bool,

    /// stop when the pc reaches this address (hex)
    #[argh(option, short = 's')]
    stop_addr: Option<String>,

    /// treat stores to this address (hex) as run termination,
    /// overriding the image's tohost symbol
    #[argh(option)]
    tohost: Option<String>,

    /// raise address-misaligned traps on misaligned data accesses
    #[argh(switch)]
    strict_align: bool,

    /// run the built-in self test and exit
    #[argh(switch)]
    self_test: bool,

    /// program images: ELF executables, or hex files ending in .hex
    #[argh(positional)]
    images: Vec<String>,
}

fn parse_addr(s: &str) -> anyhow::Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    match u64::from_str_radix(digits, 16) {
        Ok(addr) => Ok(addr),
        Err(_) => bail!("bad address {s}"),
    }
}

#[allow(clippy::case_sensitive_file_extension_comparisons)]
fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let xlen = match args.xlen {
        32 => Xlen::Rv32,
        64 => Xlen::Rv64,
        other => bail!("unsupported register width {other}"),
    };
    let memory_megs = args.memory_megs.unwrap_or(256);
    let mut sim = Simulator::new(xlen, memory_megs * 1024 * 1024);

    if args.self_test {
        if sim.hart.self_test() {
            println!("self test passed");
            return Ok(());
        }
        bail!("self test failed");
    }

    if args.images.is_empty() {
        bail!("I have nothing to run");
    }

    let mut start = None;
    for path in &args.images {
        if path.ends_with(".hex") {
            sim.load_hex_file(path)?;
        } else {
            let info = sim.load_elf_file(path)?;
            log::info!("{path}: entry {:#x}", info.entry);
            if start.is_none() {
                start = Some(info.entry);
            }
            if let Some(tohost) = info.tohost {
                sim.hart.set_tohost_address(tohost);
            }
            if let Some(exit) = info.exit {
                sim.hart.set_stop_address(exit);
            }
        }
    }

    if let Some(s) = &args.stop_addr {
        sim.hart.set_stop_address(parse_addr(s)?);
    }
    if let Some(s) = &args.tohost {
        sim.hart.set_tohost_address(parse_addr(s)?);
    }
    sim.hart.set_strict_align(args.strict_align);
    sim.hart.poke_pc(start.unwrap_or(0));

    let mut sink: Option<Box<dyn Write>> = if let Some(path) = &args.trace_file {
        Some(Box::new(BufWriter::new(File::create(path)?)))
    } else if args.trace {
        Some(Box::new(io::stdout()))
    } else {
        None
    };

    let outcome = match sink.as_mut() {
        Some(b) => sim.hart.run(Some(b.as_mut())),
        None => sim.hart.run(None),
    };
    if let Some(sink) = sink.as_mut() {
        sink.flush()?;
    }

    let reason = match outcome {
        RunOutcome::StopAddress => "stop address reached",
        RunOutcome::ToHost => "tohost write",
        RunOutcome::Terminated => "terminated",
    };
    println!(
        "{reason} after {} retired instructions, pc {:#x}",
        sim.hart.retired_insts(),
        sim.hart.peek_pc()
    );
    Ok(())
}
