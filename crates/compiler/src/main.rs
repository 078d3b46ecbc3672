//! pythoc CLI
//!
//! Compiles frontend-produced module ASTs (JSON) into native shared
//! libraries, and can load and call a compiled function for quick checks.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use pythoc::{
    compile_module, load_module_file, module_group_keys, CompilerConfig, CompilerSession, Loader,
    OptimizationLevel, ScalarValue,
};
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "pythoc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "pythoc - ahead-of-time compiler for Python-syntax typed modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile module ASTs (JSON) into shared libraries
    Build {
        /// Input module AST files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Build output directory
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,

        /// Optimization level (overrides PC_OPT_LEVEL)
        #[arg(short = 'O', long)]
        opt_level: Option<i64>,

        /// Keep pre-optimization IR next to the objects
        #[arg(long)]
        save_ir: bool,

        /// Extra library search paths
        #[arg(short = 'L', value_name = "PATH")]
        library_paths: Vec<PathBuf>,

        /// Extra libraries linked into every shared library
        #[arg(short = 'l', value_name = "NAME")]
        libraries: Vec<String>,
    },

    /// Compile a module, load it, and call a function with integer args
    Run {
        /// Input module AST file
        input: PathBuf,

        /// Function to call (bare or module-qualified name)
        function: String,

        /// Integer arguments
        args: Vec<i64>,

        /// Build output directory
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PYTHOC_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            inputs,
            build_dir,
            opt_level,
            save_ir,
            library_paths,
            libraries,
        } => {
            let mut config = CompilerConfig::from_env().with_build_dir(build_dir);
            if let Some(level) = opt_level {
                config.opt_level = OptimizationLevel::from_int(level);
            }
            config.save_unopt_ir |= save_ir;
            config.library_paths.extend(library_paths);
            config.libraries.extend(libraries);
            run_build(config, &inputs);
        }
        Commands::Run { input, function, args, build_dir } => {
            let config = CompilerConfig::from_env().with_build_dir(build_dir);
            run_call(config, &input, &function, &args);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn run_build(config: CompilerConfig, inputs: &[PathBuf]) {
    let mut session = CompilerSession::new(config);

    // Declaration pass over every module first so cross-module calls
    // resolve regardless of input order
    let mut modules = Vec::with_capacity(inputs.len());
    for input in inputs {
        match load_module_file(input) {
            Ok(module) => modules.push(module),
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }
    for module in &modules {
        if let Err(e) = session.register_module(module) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
    for module in &modules {
        let keys = module_group_keys(&session, &module.file);
        for key in keys {
            if let Err(e) = pythoc::ensure_group(&mut session, &key) {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }
    for warning in &session.warnings {
        eprintln!("warning: {}", warning);
    }
}

fn run_call(config: CompilerConfig, input: &PathBuf, function: &str, args: &[i64]) {
    let mut session = CompilerSession::new(config);
    let module = match load_module_file(input) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if let Err(e) = compile_module(&mut session, &module) {
        eprintln!("{}", e);
        process::exit(1);
    }

    let info = match session.resolve_function(function, &module.file) {
        Some(info) => info.clone(),
        None => {
            eprintln!("NameError: unresolved function '{}'", function);
            process::exit(1);
        }
    };
    let mut loader = Loader::new();
    let scalar_args: Vec<ScalarValue> = args.iter().map(|v| ScalarValue::Int(*v)).collect();
    let result = loader
        .prepare(&mut session, &info.group_key)
        .and_then(|()| loader.call_scalar(&info, &scalar_args));
    match result {
        Ok(ScalarValue::Void) => {}
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
