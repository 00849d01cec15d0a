//! Command-line front end over the out-of-core point-cloud engine: `sort`
//! turns a point source into a sorted stream + descriptor, `build` folds
//! a sorted stream into a sibling-group store, `stats` reports on an
//! already-built store. Kept thin per the library/CLI split: every real
//! decision lives in `octlod`, this binary only wires flags to it and
//! maps errors to exit codes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use octlod::builder::{self, BuildConfig, CancelToken};
use octlod::config::{init_logging, Config};
use octlod::descriptor::OctreeDescriptor;
use octlod::io::{FaceList, PlyPointSource, SortedStreamReader, SortedStreamWriter};
use octlod::memory::MemoryGovernor;
use octlod::morton::{MortonCode, MortonMedium};
use octlod::point::AttributeSet;
use octlod::sort::{compute_bounds, compute_scale, build_dim, ExternalSorter};
use octlod::store::SiblingGroupStore;

#[derive(Parser)]
#[command(name = "octlod", about = "Out-of-core LOD engine for massive point clouds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scale and Morton-sort a point source, writing a sorted stream and
    /// its descriptor sidecar.
    Sort {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long, default_value_t = 16)]
        max_level: u32,
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
        /// Optional face-list passthrough: read once, re-emitted verbatim
        /// next to the sorted stream as `<output>.faces`. Neither this
        /// stage nor `build` interprets face indices.
        #[arg(long)]
        faces: Option<PathBuf>,
    },
    /// Build the sibling-group store from a sorted stream.
    Build {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        progress: PathBuf,
        /// Optional face-list passthrough: read once, re-emitted verbatim
        /// next to the store as `<store>.faces`.
        #[arg(long)]
        faces: Option<PathBuf>,
    },
    /// Print descriptor and root-node summary for an already-built store.
    Stats {
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long)]
        store: PathBuf,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let cfg = Config::default().with_env_overrides();
    if let Err(e) = run(cli, &cfg) {
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<octlod::error::OctError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(cli: Cli, cfg: &Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Sort {
            input,
            output,
            descriptor,
            max_level,
            tmp_dir,
            faces,
        } => run_sort(&input, &output, &descriptor, max_level, tmp_dir, faces, cfg),
        Command::Build {
            input,
            descriptor,
            store,
            progress,
            faces,
        } => run_build(&input, &descriptor, &store, &progress, faces, cfg),
        Command::Stats { descriptor, store } => run_stats(&descriptor, &store, cfg),
    }
}

/// Derives `<path>.<ext>` for a face-list sidecar next to a sort/build
/// output path, preserving the original file name rather than replacing
/// its extension.
fn sidecar_path(path: &std::path::Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

fn run_sort(
    input: &std::path::Path,
    output: &std::path::Path,
    descriptor_path: &std::path::Path,
    max_level: u32,
    tmp_dir: Option<PathBuf>,
    faces: Option<PathBuf>,
    cfg: &Config,
) -> anyhow::Result<()> {
    if let Some(faces_path) = &faces {
        let face_list = FaceList::read_ascii(faces_path)?;
        let sidecar = sidecar_path(output, "faces");
        face_list.write_ascii(&sidecar)?;
        log::info!("passed through {} faces to {sidecar:?}", face_list.0.len());
    }
    let source = PlyPointSource::open(input);
    let (min, max, count) = compute_bounds(&source)?;
    log::info!("bounds: min={min:?} max={max:?} count={count}");
    let dim = build_dim(min, max, max_level);
    let scale = compute_scale(min, max);

    let tmp = tmp_dir.unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&tmp)?;
    let sorter = ExternalSorter::new(dim, min, scale, cfg.mem_quota, &tmp);
    let stream = sorter.sort::<MortonMedium, _>(&source, count)?;

    let mut writer = SortedStreamWriter::create(output, count)?;
    let mut written = 0u64;
    for item in stream {
        let (code, point) = item?;
        writer.write_record(code.bits(), &point)?;
        written += 1;
    }
    writer.finish()?;

    let descriptor = OctreeDescriptor::new(
        output.to_path_buf(),
        PathBuf::from(&cfg.db_dir).join("store.blob"),
        dim,
        scale,
        AttributeSet::POS_NORMAL_COLOR,
        written,
    );
    descriptor.write(descriptor_path)?;
    log::info!("wrote {written} sorted points to {output:?}");
    Ok(())
}

fn run_build(
    input: &std::path::Path,
    descriptor_path: &std::path::Path,
    store_path: &std::path::Path,
    progress_path: &std::path::Path,
    faces: Option<PathBuf>,
    cfg: &Config,
) -> anyhow::Result<()> {
    if let Some(faces_path) = &faces {
        let face_list = FaceList::read_ascii(faces_path)?;
        let sidecar = sidecar_path(store_path, "faces");
        face_list.write_ascii(&sidecar)?;
        log::info!("passed through {} faces to {sidecar:?}", face_list.0.len());
    }
    let descriptor = OctreeDescriptor::read(descriptor_path)?;
    let governor = MemoryGovernor::new(cfg.mem_quota);
    let store = SiblingGroupStore::<MortonMedium>::open(store_path, governor, descriptor.attributes, cfg.workers)?;
    let reader = SortedStreamReader::<MortonMedium>::open(input)?;
    let build_cfg = BuildConfig {
        work_item: cfg.work_item,
        inner_cap: cfg.work_item,
        leaf_cap: cfg.work_item,
    };
    builder::build(reader, &store, progress_path, &build_cfg, &CancelToken::new())?;
    log::info!("build complete, root resident in {store_path:?}");
    Ok(())
}

fn run_stats(descriptor_path: &std::path::Path, store_path: &std::path::Path, cfg: &Config) -> anyhow::Result<()> {
    let descriptor = OctreeDescriptor::read(descriptor_path)?;
    let governor = MemoryGovernor::new(cfg.mem_quota);
    let store = SiblingGroupStore::<MortonMedium>::open(store_path, governor, descriptor.attributes, 1)?;
    let root = store.get(MortonMedium::root())?;
    println!("points:      {}", descriptor.count);
    println!("attributes:  {}", descriptor.attributes.descriptor_name());
    println!("depth:       {}", descriptor.dim.max_level);
    println!("root mask:   {:#010b}", root.children_mask);
    println!("root samples:{}", root.samples.len());
    Ok(())
}
