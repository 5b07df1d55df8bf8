//! Component Module for Fluff Compiler
//!
//! Drives whole components through parse, code generation and finalization.
//! Batches parse in parallel and generate sequentially, so the shared tables
//! grow in input order no matter how the parse work was scheduled.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use crate::cache::ParseCache;
use crate::codegen::{CodeGenerator, CompilationSession, ExpressionTables, GeneratedTemplate};
use crate::finalize::{expression_table_module, finalize_component, FinalizedComponent};
use crate::parse::CompileOptions;
use crate::validate::{CompilerError, ParsedTemplate};

/// One component as handed to the compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSource {
    pub selector: String,
    pub class_name: String,
    pub template: String,
    #[serde(default)]
    pub styles: Option<String>,
}

impl ComponentSource {
    pub fn new(selector: &str, class_name: &str, template: &str) -> Self {
        ComponentSource {
            selector: selector.to_string(),
            class_name: class_name.to_string(),
            template: template.to_string(),
            styles: None,
        }
    }

    pub fn with_styles(mut self, styles: &str) -> Self {
        self.styles = Some(styles.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledComponent {
    pub selector: String,
    pub generated: GeneratedTemplate,
    pub output: FinalizedComponent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutput {
    pub components: Vec<CompiledComponent>,
    pub tables: ExpressionTables,
    pub expression_module: String,
}

fn options_for(source: &ComponentSource, base: &CompileOptions) -> CompileOptions {
    CompileOptions {
        selector: source.selector.clone(),
        ..base.clone()
    }
}

fn generate_parsed(
    session: &mut CompilationSession,
    source: &ComponentSource,
    options: &CompileOptions,
    parsed: &ParsedTemplate,
) -> Result<CompiledComponent, CompilerError> {
    let generated = CodeGenerator::new(session, options).generate(parsed)?;
    let output = finalize_component(
        &source.selector,
        &source.class_name,
        &generated,
        source.styles.as_deref(),
    )?;
    Ok(CompiledComponent {
        selector: source.selector.clone(),
        generated,
        output,
    })
}

/// Compile a single component against an existing session.
pub fn compile_component(
    session: &mut CompilationSession,
    source: &ComponentSource,
    options: &CompileOptions,
    cache: &ParseCache,
) -> Result<CompiledComponent, CompilerError> {
    let start = Instant::now();
    let options = options_for(source, options);
    let parsed = cache.get_or_parse(&source.template, &options)?;
    let compiled = generate_parsed(session, source, &options, &parsed)?;
    debug!(
        selector = %source.selector,
        elapsed_us = start.elapsed().as_micros() as u64,
        "compiled component"
    );
    Ok(compiled)
}

/// Compile a batch of components into one set of shared tables.
/// The first failing component (in input order) aborts the batch.
pub fn compile_components(
    sources: &[ComponentSource],
    options: &CompileOptions,
) -> Result<CompileOutput, CompilerError> {
    let start = Instant::now();
    let cache = ParseCache::for_options(options);

    let parsed: Vec<Result<(CompileOptions, ParsedTemplate), CompilerError>> = sources
        .par_iter()
        .map(|source| {
            let options = options_for(source, options);
            let parsed = cache.get_or_parse(&source.template, &options)?;
            Ok((options, parsed))
        })
        .collect();

    let mut session = CompilationSession::new();
    let mut components = Vec::with_capacity(sources.len());
    for (source, result) in sources.iter().zip(parsed) {
        let (options, parsed) = result?;
        components.push(generate_parsed(&mut session, source, &options, &parsed)?);
    }

    let expression_module = expression_table_module(&session)?;
    let stats = cache.stats();
    debug!(
        components = components.len(),
        expressions = session.expression_count(),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        elapsed_us = start.elapsed().as_micros() as u64,
        "compiled component batch"
    );

    Ok(CompileOutput {
        components,
        tables: session.tables(),
        expression_module,
    })
}
