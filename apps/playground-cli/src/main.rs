mod config;
mod scene;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use config::AppConfig;
use glam::Vec3;
use playground_common::{MeshHandle, Transform};
use playground_ecs::{Render, Update, World};
use playground_render::descriptor::CullMode;
use playground_render::shader::{
    CompilingShaderProvider, DiskArtifactStore, FileSource, PrecompiledShaderProvider,
    ShaderArtifact, ShaderProvider, ShaderRequest, ShaderStage,
};
use playground_render::{
    DebugTextRenderer, DrawList, FrameContext, HeadlessBackend, PipelineCache, RenderView,
    Renderer, collect_draws,
};
use playground_render_wgpu::{
    GpuContext, SceneRenderer, WgpuPipelineBackend, builtin_sources, scene_pipeline_descriptor,
};
use scene::{SceneMeshes, populate, register_spin};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Fixed simulation step for headless runs.
const DELTA_SECONDS: f32 = 1.0 / 60.0;

#[derive(Parser)]
#[command(name = "playground", about = "Headless driver for the playground runtime core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate versions
    Info,
    /// Run the frame loop against the headless pipeline backend
    Demo {
        /// Number of spinning cubes
        #[arg(short, long, default_value = "8")]
        entities: usize,
        /// Frames to run
        #[arg(short, long, default_value = "120")]
        frames: u64,
        /// Directory with scene.wgsl and its includes
        #[arg(long)]
        shader_dir: Option<PathBuf>,
        /// Serve shaders from `<source>.<vert|frag>.spv` files instead of compiling
        #[arg(long, conflicts_with = "shader_dir")]
        precompiled: Option<PathBuf>,
    },
    /// Compile or validate shader files and report diagnostics
    Check {
        /// WGSL sources or `.spv` files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long, value_enum, default_value = "vertex")]
        stage: StageArg,
        /// Entry point name
        #[arg(short, long, default_value = "vs_main")]
        entry: String,
        /// Write `<file>.<vert|frag>.spv` for each compiled source here
        #[arg(long)]
        emit_dir: Option<PathBuf>,
    },
    /// Render the demo scene offscreen with wgpu
    Render {
        #[arg(long, default_value = "640")]
        width: u32,
        #[arg(long, default_value = "360")]
        height: u32,
        #[arg(short, long, default_value = "1")]
        frames: u64,
        #[arg(short, long, default_value = "8")]
        entities: usize,
        #[arg(long)]
        shader_dir: Option<PathBuf>,
        /// Write the last frame as a binary PPM
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rebuild the scene pipeline whenever shader files change
    Watch {
        #[arg(long)]
        shader_dir: Option<PathBuf>,
        #[arg(short, long, default_value = "600")]
        frames: u64,
        #[arg(long, default_value = "100")]
        interval_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Vertex,
    Fragment,
}

impl From<StageArg> for ShaderStage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::Vertex => ShaderStage::Vertex,
            StageArg::Fragment => ShaderStage::Fragment,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("playground v{}", env!("CARGO_PKG_VERSION"));
            println!("ecs: {}", playground_ecs::crate_info());
            println!("render: {}", playground_render::crate_info());
            println!("shader cache: {:?}", config.pipeline);
        }
        Commands::Demo {
            entities,
            frames,
            shader_dir,
            precompiled,
        } => {
            if shader_dir.is_some() {
                config.shader_dir = shader_dir;
            }
            let provider: Box<dyn ShaderProvider> = match precompiled {
                Some(dir) => {
                    let mut provider = PrecompiledShaderProvider::new();
                    provider
                        .load_dir(&dir)
                        .with_context(|| format!("loading precompiled shaders from {}", dir.display()))?;
                    Box::new(provider)
                }
                None => Box::new(compiling_provider(&config)?),
            };
            run_demo(&config, provider, entities, frames)?;
        }
        Commands::Check {
            files,
            stage,
            entry,
            emit_dir,
        } => run_check(&files, stage.into(), &entry, emit_dir.as_deref())?,
        Commands::Render {
            width,
            height,
            frames,
            entities,
            shader_dir,
            output,
        } => {
            if shader_dir.is_some() {
                config.shader_dir = shader_dir;
            }
            run_render(&config, width, height, frames, entities, output.as_deref())?;
        }
        Commands::Watch {
            shader_dir,
            frames,
            interval_ms,
        } => {
            if shader_dir.is_some() {
                config.shader_dir = shader_dir;
            }
            run_watch(&config, frames, Duration::from_millis(interval_ms))?;
        }
    }

    Ok(())
}

/// WGSL compiler over the configured shader directory, or the built-in
/// shaders, backed by the on-disk artifact cache when one is configured.
fn compiling_provider(config: &AppConfig) -> anyhow::Result<CompilingShaderProvider> {
    let provider = match &config.shader_dir {
        Some(dir) => CompilingShaderProvider::new(FileSource::new(dir)),
        None => CompilingShaderProvider::new(builtin_sources()),
    };
    Ok(match &config.artifact_dir {
        Some(dir) => provider.with_store(
            DiskArtifactStore::open(dir)
                .with_context(|| format!("opening artifact store {}", dir.display()))?,
        ),
        None => provider,
    })
}

fn run_demo(
    config: &AppConfig,
    provider: Box<dyn ShaderProvider>,
    entities: usize,
    frames: u64,
) -> anyhow::Result<()> {
    println!("Headless demo: entities={entities}, frames={frames}");
    let mut cache = PipelineCache::new(HeadlessBackend::new(), provider, config.pipeline);
    let descriptor = scene_pipeline_descriptor(CullMode::Back);

    let world = World::new();
    let meshes = SceneMeshes {
        cube: MeshHandle(0),
        plane: MeshHandle(1),
    };
    let spawned = populate(&world, meshes, entities)?;
    // Alive but not drawable: no mesh.
    world.spawn().with(Transform::default())?;
    register_spin(&world, DELTA_SECONDS);
    let draw_list = DrawList::new();
    draw_list.register(&world);

    let view = RenderView::default();
    let mut renderer = DebugTextRenderer::new();
    let mut last_output = String::new();
    for frame in 1..=frames {
        world.run_schedule::<Update>()?;
        draw_list.begin(&FrameContext {
            view_proj: view.view_projection(),
            frame,
            delta_seconds: DELTA_SECONDS,
        });
        world.run_schedule::<Render>()?;
        let draws = draw_list.take();

        let handle = cache
            .get_or_create_graphics_pipeline(&descriptor)
            .context("building the scene pipeline")?;
        tracing::debug!(frame, draws = draws.len(), %handle, "frame submitted");
        last_output = renderer.render(&view, &draws);

        if frame == frames / 2 && spawned.len() > 1 {
            let victim = spawned[1];
            world.destroy(victim)?;
            let replacement = world
                .spawn()
                .with(Transform::from_position(Vec3::new(0.0, 3.0, 0.0)))?
                .with(meshes.cube)?
                .id();
            println!(
                "frame {frame}: destroyed {victim}, spawned {replacement}; {victim} alive: {}",
                world.is_alive(victim)
            );
        }
        cache.end_frame();
    }
    if frames > 0 {
        print!("{last_output}");
    }

    let stats = cache.stats();
    println!(
        "Pipelines: {} cached, {} built, {} hits, {} rebuilds",
        cache.len(),
        stats.builds,
        stats.hits,
        stats.rebuilds
    );
    println!(
        "Entities: {} alive, systems: update={} render={}",
        world.entity_count(),
        world.system_count::<Update>(),
        world.system_count::<Render>()
    );
    cache.teardown();
    println!("Released pipelines: {}", cache.backend().released());
    world.teardown();
    Ok(())
}

fn check_file(file: &Path, stage: ShaderStage, entry: &str) -> anyhow::Result<Arc<ShaderArtifact>> {
    let name = file
        .file_name()
        .with_context(|| format!("{} is not a file", file.display()))?
        .to_string_lossy()
        .into_owned();
    let root = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let request = ShaderRequest::new(&name, entry);

    if file.extension().is_some_and(|ext| ext == "spv") {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let mut provider = PrecompiledShaderProvider::new();
        provider.insert(&name, stage, &bytes)?;
        Ok(provider.resolve_shader(&request, stage)?)
    } else {
        let mut provider = CompilingShaderProvider::new(FileSource::new(root));
        Ok(provider.resolve_shader(&request, stage)?)
    }
}

fn run_check(
    files: &[PathBuf],
    stage: ShaderStage,
    entry: &str,
    emit_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let mut failures = 0;
    for file in files {
        match check_file(file, stage, entry) {
            Ok(artifact) => {
                println!(
                    "ok    {} ({stage} '{entry}', {} words, fingerprint {}, {})",
                    file.display(),
                    artifact.spirv.len(),
                    artifact.fingerprint,
                    artifact.resources
                );
                if let Some(dir) = emit_dir {
                    let path = dir.join(format!("{}.{}.spv", artifact.source, stage.suffix()));
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let bytes: Vec<u8> = artifact.spirv.iter().flat_map(|w| w.to_le_bytes()).collect();
                    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
                }
            }
            Err(err) => {
                failures += 1;
                println!("error {}: {err:#}", file.display());
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} shader(s) failed", files.len());
    }
    Ok(())
}

fn run_render(
    config: &AppConfig,
    width: u32,
    height: u32,
    frames: u64,
    entities: usize,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let gpu = GpuContext::headless().context("opening a GPU device")?;
    println!("Adapter: {} ({:?})", gpu.adapter.name, gpu.adapter.backend);

    let mut cache = PipelineCache::new(
        WgpuPipelineBackend::new(gpu.device.clone()),
        compiling_provider(config)?,
        config.pipeline,
    );
    let descriptor = scene_pipeline_descriptor(CullMode::Back);
    let mut renderer = SceneRenderer::new(gpu.device.clone(), width, height);
    renderer.set_clear_color(config.clear_color);

    let world = World::new();
    let meshes = SceneMeshes {
        cube: renderer.mesh("cube").context("renderer has no cube mesh")?,
        plane: renderer.mesh("plane").context("renderer has no plane mesh")?,
    };
    populate(&world, meshes, entities)?;
    register_spin(&world, DELTA_SECONDS);

    let (w, h) = renderer.size();
    let view = RenderView {
        eye: Vec3::new(0.0, 8.0, 12.0),
        aspect: w as f32 / h as f32,
        ..RenderView::default()
    };
    let mut draws_issued = 0;
    for _ in 0..frames {
        world.run_schedule::<Update>()?;
        let draws = collect_draws(&world, view.view_projection())?;
        let handle = cache
            .get_or_create_graphics_pipeline(&descriptor)
            .context("building the scene pipeline")?;
        let pipeline = cache.pipeline(handle).context("scene pipeline missing from cache")?;
        let stats = renderer.render(&gpu.queue, pipeline, &draws);
        draws_issued += stats.draws;
        cache.end_frame();
    }

    let image = renderer.read_frame(&gpu.queue)?;
    println!(
        "Rendered {frames} frame(s) at {w}x{h}: {draws_issued} draws, {} covered pixels",
        image.covered_pixels(renderer.clear_bytes())
    );
    if let Some(path) = output {
        image
            .write_ppm(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    println!("Shader compiles: {}", cache.provider().stats().compiles);
    cache.teardown();
    world.teardown();
    Ok(())
}

fn run_watch(config: &AppConfig, frames: u64, interval: Duration) -> anyhow::Result<()> {
    let dir = config
        .shader_dir
        .clone()
        .context("watch needs --shader-dir or shader_dir in the config")?;
    let mut cache = PipelineCache::new(HeadlessBackend::new(), compiling_provider(config)?, config.pipeline);
    let descriptor = scene_pipeline_descriptor(CullMode::Back);
    println!("Watching {} for {frames} frames", dir.display());

    let mut handle = None;
    let mut reported: Option<String> = None;
    for frame in 1..=frames {
        if handle.is_none() {
            match cache.get_or_create_graphics_pipeline(&descriptor) {
                Ok(built) => {
                    println!("frame {frame}: built {built}");
                    handle = Some(built);
                    reported = None;
                }
                Err(err) => {
                    let message = err.to_string();
                    if reported.as_deref() != Some(message.as_str()) {
                        println!("frame {frame}: {message}");
                        reported = Some(message);
                    }
                }
            }
        }

        let report = cache.end_frame();
        if report.rebuilt > 0 {
            println!("frame {frame}: rebuilt {} pipeline(s)", report.rebuilt);
            reported = None;
        }
        if let Some(error) = handle.and_then(|h| cache.info(h)).and_then(|info| info.last_error) {
            if reported.as_deref() != Some(error.as_str()) {
                println!("frame {frame}: keeping previous pipeline: {error}");
                reported = Some(error);
            }
        }
        std::thread::sleep(interval);
    }

    let stats = cache.stats();
    let compiles = cache.provider().stats();
    println!(
        "Rebuilds: {}, failed: {}, compiles: {}, compile failures: {}",
        stats.rebuilds, stats.failed_rebuilds, compiles.compiles, compiles.failures
    );
    cache.teardown();
    Ok(())
}
