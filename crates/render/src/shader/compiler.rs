//! Include resolution and WGSL to SPIR-V compilation.
//!
//! `#include "path"` lines are spliced in place, resolved relative to the
//! including file. Each file is spliced at most once per composition.

use super::{Fingerprint, ResourceCounts, ShaderError, ShaderSource, ShaderStage, SourceId};
use std::collections::HashSet;

/// Fully expanded shader text plus the files it was built from.
#[derive(Debug, Clone)]
pub struct ComposedSource {
    pub text: String,
    /// Every file read, with the revision observed before reading it.
    pub dependencies: Vec<(SourceId, u64)>,
    pub fingerprint: Fingerprint,
}

/// Expand `root` and its includes into a single text.
pub fn compose(
    source: &dyn ShaderSource,
    root: &SourceId,
    stage: ShaderStage,
) -> Result<ComposedSource, ShaderError> {
    let mut composer = Composer {
        source,
        stage,
        root,
        stack: Vec::new(),
        included: HashSet::new(),
        dependencies: Vec::new(),
        text: String::new(),
    };
    let revision = source.revision(root).map_err(|e| ShaderError::Io {
        id: root.clone(),
        source: e,
    })?;
    let text = source.read(root).map_err(|e| ShaderError::Io {
        id: root.clone(),
        source: e,
    })?;
    composer.dependencies.push((root.clone(), revision));
    composer.included.insert(root.clone());
    composer.splice(root, &text)?;

    let fingerprint = Fingerprint::of(composer.text.as_bytes());
    Ok(ComposedSource {
        text: composer.text,
        dependencies: composer.dependencies,
        fingerprint,
    })
}

struct Composer<'a> {
    source: &'a dyn ShaderSource,
    stage: ShaderStage,
    root: &'a SourceId,
    stack: Vec<SourceId>,
    included: HashSet<SourceId>,
    dependencies: Vec<(SourceId, u64)>,
    text: String,
}

impl Composer<'_> {
    fn splice(&mut self, id: &SourceId, text: &str) -> Result<(), ShaderError> {
        self.stack.push(id.clone());
        for (line_no, line) in text.lines().enumerate() {
            let Some(rest) = line.trim_start().strip_prefix("#include") else {
                self.text.push_str(line);
                self.text.push('\n');
                continue;
            };
            let target = parse_include(rest).ok_or_else(|| {
                self.error(format!("{id}:{}: malformed include directive", line_no + 1))
            })?;
            let target = id.join_relative(target);

            if self.stack.contains(&target) {
                let chain: Vec<&str> = self.stack.iter().map(SourceId::as_str).collect();
                return Err(self.error(format!(
                    "include cycle: {} -> {target}",
                    chain.join(" -> ")
                )));
            }
            if !self.included.insert(target.clone()) {
                continue;
            }

            let revision = self.source.revision(&target);
            let included = self.source.read(&target);
            let (revision, included) = match (revision, included) {
                (Ok(r), Ok(t)) => (r, t),
                (Err(e), _) | (_, Err(e)) => {
                    return Err(self.error(format!(
                        "{id}:{}: cannot include '{target}': {e}",
                        line_no + 1
                    )));
                }
            };
            self.dependencies.push((target.clone(), revision));
            self.splice(&target, &included)?;
        }
        self.stack.pop();
        Ok(())
    }

    fn error(&self, diagnostic: String) -> ShaderError {
        ShaderError::Compile {
            id: self.root.clone(),
            stage: self.stage,
            diagnostic,
        }
    }
}

fn parse_include(rest: &str) -> Option<&str> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('<').and_then(|r| r.strip_suffix('>')))?;
    (!inner.is_empty()).then_some(inner)
}

/// Output of a successful compilation.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub spirv: Vec<u32>,
    pub resources: ResourceCounts,
}

/// Parse, validate and emit SPIR-V for one entry point.
///
/// The error is human-readable diagnostic text.
pub fn compile_wgsl(
    text: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> Result<CompiledShader, String> {
    let module = naga::front::wgsl::parse_str(text).map_err(|e| e.emit_to_string(text))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| e.emit_to_string(text))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };
    let index = module
        .entry_points
        .iter()
        .position(|ep| ep.name == entry_point && ep.stage == naga_stage)
        .ok_or_else(|| format!("no {stage} entry point named '{entry_point}'"))?;

    let resources = reflect_resources(&module, info.get_entry_point(index));

    // wgpu ingests SPIR-V in its own clip-space convention: no y flip.
    let options = naga::back::spv::Options {
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };
    let spirv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| format!("SPIR-V generation error: {e}"))?;

    Ok(CompiledShader { spirv, resources })
}

/// Count the globals the entry point actually touches.
fn reflect_resources(module: &naga::Module, entry: &naga::valid::FunctionInfo) -> ResourceCounts {
    let mut counts = ResourceCounts::default();
    for (handle, var) in module.global_variables.iter() {
        if entry[handle].is_empty() {
            continue;
        }
        match var.space {
            naga::AddressSpace::Uniform => counts.uniform_buffers += 1,
            naga::AddressSpace::Storage { .. } => counts.storage_buffers += 1,
            naga::AddressSpace::Handle => match module.types[var.ty].inner {
                naga::TypeInner::Sampler { .. } => counts.samplers += 1,
                naga::TypeInner::Image {
                    class: naga::ImageClass::Storage { .. },
                    ..
                } => counts.storage_textures += 1,
                _ => {}
            },
            _ => {}
        }
    }
    counts
}
