use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

use native_invoker::descriptor::{RawAbi, RawDowncallSignature, RawLayout};
use native_invoker::{
    AbiDescriptor, BufferLayout, DowncallSignature, HeapCodeAllocator, StandardRuntime,
    StubObject, TrustCriterion, generate_adapter, make_native_invoker, supports_native_invoker,
};

#[derive(Parser)]
#[command(name = "native-invoker")]
#[command(about = "AArch64 native-call stub generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Criterion {
    NonBlockingLeaf,
    NoRuntimeInteraction,
}

impl From<Criterion> for TrustCriterion {
    fn from(c: Criterion) -> Self {
        match c {
            Criterion::NonBlockingLeaf => Self::NonBlockingLeaf,
            Criterion::NoRuntimeInteraction => Self::NoRuntimeInteraction,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Context-record adapter without state transitions
    Adapter {
        #[arg(long, help = "ABI descriptor JSON file")]
        abi: PathBuf,

        #[arg(long, help = "Context record layout JSON file")]
        layout: PathBuf,

        #[arg(long, value_enum, help = "Why the target may run in the managed state")]
        criterion: Criterion,

        #[arg(short, long, help = "Write the raw stub bytes here")]
        output: Option<PathBuf>,
    },
    /// Cooperative downcall stub
    Downcall {
        #[arg(long, help = "Downcall signature JSON file")]
        signature: PathBuf,

        #[arg(short, long, help = "Write the raw stub bytes here")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(
        supports_native_invoker(),
        "native invokers are not supported on this target"
    );

    let mut alloc = HeapCodeAllocator::default();
    let (stub, output) = match cli.command {
        Commands::Adapter {
            abi,
            layout,
            criterion,
            output,
        } => {
            let abi = AbiDescriptor::try_from(read_json::<RawAbi>(&abi)?)
                .context("Invalid ABI descriptor")?;
            let layout = BufferLayout::try_from(read_json::<RawLayout>(&layout)?)
                .context("Invalid context layout")?;
            let stub = generate_adapter(&abi, &layout, criterion.into(), &mut alloc)
                .context("Adapter generation failed")?;
            (stub, output)
        }
        Commands::Downcall { signature, output } => {
            let signature =
                DowncallSignature::try_from(read_json::<RawDowncallSignature>(&signature)?)
                    .context("Invalid downcall signature")?;
            let runtime = StandardRuntime::default();
            let stub = make_native_invoker(&signature, &runtime, &mut alloc)
                .context("Downcall generation failed")?;
            (stub, output)
        }
    };

    report(&stub, output.as_deref())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn report(stub: &StubObject, output: Option<&Path>) -> Result<()> {
    print!("{stub}");
    println!();
    print!("{}", stub.code().listing());

    if let Some(path) = output {
        let bytes = stub.bytes();
        fs::write(path, &bytes)
            .with_context(|| format!("Failed to write output to {}", path.display()))?;
        println!("Wrote {} ({} bytes)", path.display(), bytes.len());
    }
    Ok(())
}
