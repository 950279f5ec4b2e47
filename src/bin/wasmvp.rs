use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use wasmvp::{
    config::{Config, DebugLevel},
    dump, embed,
    exec::val::{ExternVal, Val},
    fmt::binary,
    module::{instr::Instr, FuncIndex},
};

#[derive(Parser)]
#[command(name = "wasmvp", version, about = "WebAssembly MVP interpreter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a module and print its contents.
    Dump {
        /// Path to a .wasm file
        file: PathBuf,
        /// Print the section table instead of the summary
        #[arg(long)]
        section: bool,
    },
    /// Instantiate a module and optionally call one of its exports.
    Exec {
        /// Path to a .wasm file
        file: PathBuf,
        /// Exported function to call
        #[arg(long)]
        invoke: Option<String>,
        /// Comma separated arguments, parsed per the parameter types
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<String>,
        /// Print every export of the instance
        #[arg(long)]
        list_all_exports: bool,
        /// 0 silent, 1 instruction log, 2 log with stack, 3 pause between steps
        #[arg(long, default_value_t = 0)]
        debug: u8,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Dump { file, section } => {
            init_logging(0)?;
            dump_file(&file, section)
        }
        Command::Exec {
            file,
            invoke,
            args,
            list_all_exports,
            debug,
        } => {
            init_logging(debug)?;
            exec_file(&file, invoke.as_deref(), &args, list_all_exports, debug)
        }
    }
}

fn init_logging(debug: u8) -> anyhow::Result<()> {
    let directive = if debug > 0 { "wasmvp=trace" } else { "warn" };
    let subscriber = fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}

fn dump_file(file: &Path, section: bool) -> anyhow::Result<()> {
    let module =
        binary::decode_file(file).with_context(|| format!("cannot decode {}", file.display()))?;
    if section {
        print!("{}", dump::sections(&module));
    } else {
        print!("{}", dump::summary(&module));
    }
    Ok(())
}

fn exec_file(
    file: &Path,
    invoke: Option<&str>,
    args: &[String],
    list_all_exports: bool,
    debug: u8,
) -> anyhow::Result<()> {
    let module =
        binary::decode_file(file).with_context(|| format!("cannot decode {}", file.display()))?;
    let module = embed::module_validate(module)?;

    let level = DebugLevel::from_level(debug);
    let mut store = embed::store_init();
    store.set_config(Config::default().debug(level));
    if level == DebugLevel::Interrupt {
        store.set_interrupt(pause);
    }

    let inst = embed::module_instantiate(&mut store, module, &[])?;

    if list_all_exports {
        for export in store.exports(inst) {
            match export.value {
                ExternVal::Func(addr) => {
                    let ty = embed::func_type(&store, addr)?;
                    println!("{} func {ty}", export.name);
                }
                other => println!("{} {}", export.name, other.kind()),
            }
        }
    }

    let Some(name) = invoke else {
        return Ok(());
    };
    let addr = embed::instance_export(&store, inst, name)?
        .as_func()
        .ok_or_else(|| anyhow!("export `{name}` is not a function"))?;
    let ty = embed::func_type(&store, addr)?;
    if ty.params().len() != args.len() {
        bail!(
            "`{name}` expects {} arguments, got {}",
            ty.params().len(),
            args.len()
        );
    }
    let args = ty
        .params()
        .iter()
        .zip(args)
        .map(|(ty, arg)| Val::parse_as(*ty, arg))
        .collect::<Result<Vec<_>, _>>()?;

    for val in embed::func_invoke(&mut store, addr, &args)? {
        println!("{val}");
    }
    Ok(())
}

fn pause(func: FuncIndex, pos: usize, instr: &Instr) {
    eprintln!("[{func}:{pos}] {instr:?} (press enter)");
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        tracing::warn!("stdin closed");
    }
}
