//! buildcache CLI
//!
//! Front-end binary. Invoked either directly (`buildcache gcc -c foo.c`),
//! with a maintenance flag (`--show-stats`, `--clear`, ...), or through a
//! symlink named after a compiler, in which case the whole command line
//! is the tool invocation and the real tool is found on the PATH with the
//! symlink itself excluded.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use buildcache::filesys;
use buildcache::{Config, ExePath, Invocation, LocalStore, Pipeline};

#[derive(Parser)]
#[command(name = "buildcache")]
#[command(about = "Transparent compilation cache for C/C++ build tools", version)]
struct Cli {
    /// Print cache statistics
    #[arg(short = 's', long)]
    show_stats: bool,

    /// Reset statistics counters to zero
    #[arg(short = 'z', long)]
    zero_stats: bool,

    /// Remove all cached entries
    #[arg(short = 'C', long)]
    clear: bool,

    /// Print the effective configuration
    #[arg(short = 'c', long)]
    get_config: bool,

    /// The tool invocation to cache (tool name first)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    process::exit(real_main());
}

fn real_main() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("buildcache: {err}");
            return 1;
        }
    };
    init_tracing(&config.debug);

    // Symlink mode: when installed as `gcc`, `clang`, `cl`, ... the whole
    // argv is the tool invocation.
    let argv: Vec<String> = env::args().collect();
    let invoked_as = argv
        .first()
        .map(|arg0| {
            Path::new(arg0)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    if !invoked_as.is_empty() && invoked_as != "buildcache" {
        let tool = Path::new(&argv[0])
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(invoked_as);
        return run_tool(config, &tool, &argv[1..]);
    }

    let cli = Cli::parse();
    if cli.show_stats {
        return show_stats(&config);
    }
    if cli.zero_stats {
        return zero_stats(&config);
    }
    if cli.clear {
        return clear_cache(&config);
    }
    if cli.get_config {
        println!("{}", config.dump());
        return 0;
    }
    if cli.command.is_empty() {
        eprintln!("buildcache: no command given (try --help)");
        return 1;
    }
    run_tool(config, &cli.command[0], &cli.command[1..])
}

/// Run one tool invocation through the cache.
fn run_tool(config: Config, tool: &str, args: &[String]) -> i32 {
    // Never find our own binary: a buildcache symlink installed next to
    // (or instead of) the real tool must not recurse into itself.
    let self_path = env::current_exe().unwrap_or_default();
    let found = match filesys::find_executable(tool, &self_path) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("buildcache: {err}");
            return 1;
        }
    };
    let real_path = filesys::resolve_path(&found).unwrap_or_else(|_| found.clone());

    let work_dir = match env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("buildcache: cannot determine working directory: {err}");
            return 1;
        }
    };

    let mut full_args = vec![found.to_string_lossy().into_owned()];
    full_args.extend_from_slice(args);
    let invocation = Invocation {
        exe: ExePath {
            virtual_path: PathBuf::from(tool),
            real_path,
        },
        args: full_args,
        work_dir,
    };

    // The disable switch bypasses the cache entirely, without even
    // touching the store on disk.
    if config.disabled {
        return match buildcache::runner::passthrough(
            &invocation.exe.real_path,
            &invocation.args[1..],
            &invocation.work_dir,
        ) {
            Ok(code) => code,
            Err(err) => {
                eprintln!(
                    "buildcache: failed to run {}: {err}",
                    invocation.exe.real_path.display()
                );
                1
            }
        };
    }

    match Pipeline::new(config) {
        Ok(mut pipeline) => pipeline.run(&invocation),
        Err(err) => {
            eprintln!("buildcache: {err}");
            1
        }
    }
}

fn open_store(config: &Config) -> Result<LocalStore, i32> {
    LocalStore::open(&config.dir).map_err(|err| {
        eprintln!("buildcache: cannot open cache at {}: {err}", config.dir.display());
        1
    })
}

fn show_stats(config: &Config) -> i32 {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let stats = store.ledger().read();
    let full_percentage = if config.max_cache_size > 0 {
        100.0 * stats.total_bytes as f64 / config.max_cache_size as f64
    } else {
        0.0
    };

    println!("  Cache directory:     {}", config.dir.display());
    println!("  Entries in cache:    {}", stats.entry_count);
    println!(
        "  Cache size:          {} ({:.1}%)",
        filesys::human_readable_size(stats.total_bytes),
        full_percentage
    );
    println!("  Direct hits:         {}", stats.hits_direct);
    println!("  Preprocessed hits:   {}", stats.hits_preprocessed);
    println!("  Remote hits:         {}", stats.hits_remote);
    println!("  Misses:              {}", stats.misses);
    println!("  Evictions:           {}", stats.evictions);
    0
}

fn zero_stats(config: &Config) -> i32 {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match store.ledger().zero() {
        Ok(_) => {
            println!("Statistics cleared.");
            0
        }
        Err(err) => {
            eprintln!("buildcache: {err}");
            1
        }
    }
}

fn clear_cache(config: &Config) -> i32 {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match store.clear() {
        Ok(removed) => {
            println!("Removed {removed} cache entries.");
            0
        }
        Err(err) => {
            eprintln!("buildcache: {err}");
            1
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(format!("buildcache={level}"))
        .unwrap_or_else(|_| EnvFilter::new("buildcache=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
