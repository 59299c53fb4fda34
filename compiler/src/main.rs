use clap::Parser;
use std::path::{Path, PathBuf};

use opgen::config::GenOptions;
use opgen::descriptor::KernelDescriptor;
use opgen::pass::PassId;
use opgen::pipeline::{LoopArtifacts, Session};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Module,
    Layout,
    Body,
    Kernel,
    BuildInfo,
}

impl EmitStage {
    fn terminal(self) -> PassId {
        match self {
            EmitStage::Module | EmitStage::BuildInfo => PassId::Assemble,
            EmitStage::Layout => PassId::Plan,
            EmitStage::Body => PassId::RewriteBody,
            EmitStage::Kernel => PassId::Kernel,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "opgen",
    version,
    about = "Generates CUDA Fortran kernels and host stubs for unstructured-mesh parallel loops"
)]
struct Cli {
    /// Loop descriptor files (JSON), generated in order
    #[arg(required = true)]
    loops: Vec<PathBuf>,

    /// Directory holding `<name>.inc` kernel bodies [default: next to each descriptor]
    #[arg(long)]
    body_dir: Option<PathBuf>,

    /// Output directory; artefacts go to stdout when omitted
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Module)]
    emit: EmitStage,

    /// Generator options file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log generation passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = match &cli.config {
        Some(path) => match GenOptions::from_json_file(path) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("opgen: error: {}", e);
                std::process::exit(2);
            }
        },
        None => GenOptions::default(),
    };
    log::debug!("options: {:?}", options);

    if let Some(dir) = &cli.out_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("opgen: error: {}: {}", dir.display(), e);
            std::process::exit(2);
        }
    }

    let mut session = Session::new(options);
    let mut failed = false;

    for path in &cli.loops {
        let text = read_or_exit(path);
        let desc = match KernelDescriptor::parse(&text) {
            Ok(d) => d,
            Err(d) => {
                eprintln!("opgen: {}: {}", path.display(), d);
                failed = true;
                continue;
            }
        };

        let body_dir = match &cli.body_dir {
            Some(dir) => dir.clone(),
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let body = read_body(&body_dir.join(format!("{}.inc", desc.name)));

        match session.generate(&desc, body.as_deref(), cli.emit.terminal()) {
            Ok(artifacts) => {
                log::info!("generated {} (kernel {})", desc.name, artifacts.kernel_index);
                if let Err(e) = write_output(&cli, &artifacts) {
                    eprintln!("opgen: error: {}", e);
                    std::process::exit(2);
                }
            }
            Err(e) => {
                eprintln!("opgen: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}

fn read_or_exit(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("opgen: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }
}

/// A missing body is not an I/O failure: passes that need it report E0012.
fn read_body(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("no body at {}", path.display());
            None
        }
        Err(e) => {
            eprintln!("opgen: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }
}

fn write_output(cli: &Cli, a: &LoopArtifacts) -> Result<(), String> {
    let (file_name, text) = match cli.emit {
        EmitStage::Module => match &a.module {
            Some(m) => (m.file_name.clone(), m.text.clone()),
            None => return Ok(()),
        },
        EmitStage::Layout => {
            let text = match &a.layout {
                Some(l) => serde_json::to_string_pretty(l).map_err(|e| e.to_string())? + "\n",
                None => return Ok(()),
            };
            (format!("{}.layout.json", a.loop_name), text)
        }
        EmitStage::Body => (
            format!("{}_gpu.inc", a.loop_name),
            a.device_body.clone().unwrap_or_default(),
        ),
        EmitStage::Kernel => (
            format!("{}_kernel.inc", a.loop_name),
            a.kernel.clone().unwrap_or_default(),
        ),
        EmitStage::BuildInfo => (
            format!("{}.build-info.json", a.loop_name),
            a.provenance.to_json(&a.loop_name),
        ),
    };

    match &cli.out_dir {
        Some(dir) => {
            let out = dir.join(&file_name);
            std::fs::write(&out, text).map_err(|e| format!("{}: {}", out.display(), e))?;
            log::debug!("wrote {}", out.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}
