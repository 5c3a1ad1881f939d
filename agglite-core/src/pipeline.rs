// agglite-core/src/pipeline.rs
// Pipeline driver: parse, rewrite, link, run, split

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::log_debug;
use crate::stage::filter::{ExpressionFilter, MatcherFilter};
use crate::stage::group::GroupStage;
use crate::stage::limit_skip::{LimitStage, SkipStage};
use crate::stage::out::OutStage;
use crate::stage::project::ProjectStage;
use crate::stage::sort::SortStage;
use crate::stage::source::CursorSource;
use crate::stage::unwind::UnwindStage;
use crate::stage::{pull_next, BoxedStage, SplittableStage, Stage};

/// Options recognized by the pipeline driver.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Accepted but currently unused by the in-memory group and sort.
    pub allow_disk_use: bool,
    /// Deadline; when exceeded, cancellation is signalled.
    pub max_time_ms: Option<u64>,
    /// Surface the serialized pipeline instead of result documents.
    pub explain: bool,
}

impl PipelineOptions {
    pub fn new() -> PipelineOptions {
        PipelineOptions::default()
    }

    pub fn with_allow_disk_use(mut self, allow: bool) -> PipelineOptions {
        self.allow_disk_use = allow;
        self
    }

    pub fn with_max_time_ms(mut self, ms: u64) -> PipelineOptions {
        self.max_time_ms = Some(ms);
        self
    }

    pub fn with_explain(mut self, explain: bool) -> PipelineOptions {
        self.explain = explain;
        self
    }
}

/// An ordered chain of stages sharing the pull contract.
///
/// The pipeline owns its stages; stage index 0 is the source once one is
/// attached. Rewrite runs once (`prepare`), then `run` drives the last
/// stage to exhaustion and disposes every stage in order.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<BoxedStage>,
    ctx: Arc<ExecContext>,
    options: PipelineOptions,
    has_source: bool,
    prepared: bool,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Pipeline {
        let ctx = match options.max_time_ms {
            Some(ms) => ExecContext::with_deadline(Duration::from_millis(ms)),
            None => ExecContext::new(),
        };
        Pipeline {
            stages: Vec::new(),
            ctx,
            options,
            has_source: false,
            prepared: false,
        }
    }

    /// Parse an ordered stage list from a JSON array of `{$name: spec}`
    /// stage documents. The result has no source; attach one before
    /// running.
    pub fn parse(spec: &Json, options: PipelineOptions) -> Result<Pipeline> {
        let Json::Array(stage_specs) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "pipeline must be an array".to_string(),
            ));
        };
        if stage_specs.is_empty() {
            return Err(AggLiteError::InvalidSpec(
                "pipeline cannot be empty".to_string(),
            ));
        }

        let mut pipeline = Pipeline::new(options);
        for stage_spec in stage_specs {
            let Json::Object(map) = stage_spec else {
                return Err(AggLiteError::InvalidSpec(
                    "each stage must be an object".to_string(),
                ));
            };
            if map.len() != 1 {
                return Err(AggLiteError::InvalidSpec(
                    "each stage must have exactly one operator".to_string(),
                ));
            }
            let (name, inner) = map.iter().next().expect("len checked");
            let ctx = Arc::clone(&pipeline.ctx);
            let stage: BoxedStage = match name.as_str() {
                MatcherFilter::NAME => Box::new(MatcherFilter::from_json(ctx, inner)?),
                ExpressionFilter::NAME => Box::new(ExpressionFilter::from_json(ctx, inner)?),
                ProjectStage::NAME => Box::new(ProjectStage::from_json(ctx, inner)?),
                GroupStage::NAME => Box::new(GroupStage::from_json(ctx, inner)?),
                SortStage::NAME => Box::new(SortStage::from_json(ctx, inner)?),
                LimitStage::NAME => Box::new(LimitStage::from_json(ctx, inner)?),
                SkipStage::NAME => Box::new(SkipStage::from_json(ctx, inner)?),
                UnwindStage::NAME => Box::new(UnwindStage::from_json(ctx, inner)?),
                OutStage::NAME => Box::new(OutStage::from_json(ctx, inner)?),
                other => {
                    return Err(AggLiteError::InvalidSpec(format!(
                        "Unknown pipeline stage: {}",
                        other
                    )))
                }
            };
            pipeline.stages.push(stage);
        }
        Ok(pipeline)
    }

    /// The execution context shared by this pipeline's stages; sources
    /// must be constructed with it.
    pub fn context(&self) -> Arc<ExecContext> {
        Arc::clone(&self.ctx)
    }

    /// Install the source at the head of the chain.
    pub fn attach_source(&mut self, source: BoxedStage) -> Result<()> {
        if self.has_source {
            return Err(AggLiteError::InvalidSpec(
                "pipeline already has a source".to_string(),
            ));
        }
        self.stages.insert(0, source);
        self.has_source = true;
        Ok(())
    }

    /// Append a stage; programmatic alternative to `parse`.
    pub fn add_stage(&mut self, stage: BoxedStage) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the rewrite passes and link the chain. Idempotent; `run` calls
    /// it if the caller has not.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.optimize_pass();
        self.coalesce_pass();
        self.pushdown_pass();
        self.dependency_pass()?;
        self.link_pass()?;
        self.prepared = true;
        Ok(())
    }

    fn optimize_pass(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.optimize();
        }
    }

    /// Repeatedly merge adjacent pairs left to right until a fixpoint.
    fn coalesce_pass(&mut self) {
        let mut i = 0;
        while i + 1 < self.stages.len() {
            let (left, right) = self.stages.split_at_mut(i + 1);
            if left[i].coalesce(right[0].as_ref()) {
                let removed = self.stages.remove(i + 1);
                log_debug!("coalesced {} into {}", removed.name(), self.stages[i].name());
            } else {
                i += 1;
            }
        }
    }

    /// Move leading filters, a leading sort, and a simple projection into
    /// the cursor source.
    fn pushdown_pass(&mut self) {
        if !self
            .stages
            .first()
            .is_some_and(|s| s.as_any().is::<CursorSource>())
        {
            return;
        }

        loop {
            if self.stages.len() < 2 {
                return;
            }
            let predicate = {
                let next = self.stages[1].as_ref();
                if let Some(m) = next.as_any().downcast_ref::<MatcherFilter>() {
                    m.match_predicate()
                } else if let Some(f) = next.as_any().downcast_ref::<ExpressionFilter>() {
                    f.match_predicate()
                } else {
                    None
                }
            };
            let Some(predicate) = predicate else { break };
            let removed = self.stages.remove(1);
            log_debug!("pushed {} predicate into {}", removed.name(), CursorSource::NAME);
            self.cursor_source().push_down_query(predicate);
        }

        if self.stages.len() >= 2 {
            if let Some(sort) = self.stages[1].as_any().downcast_ref::<SortStage>() {
                let keys = sort.keys().to_vec();
                self.stages.remove(1);
                log_debug!("pushed {} into {}", SortStage::NAME, CursorSource::NAME);
                self.cursor_source().push_down_sort(keys);
            }
        }

        if self.stages.len() >= 2 {
            let fields = self.stages[1]
                .as_any()
                .downcast_ref::<ProjectStage>()
                .and_then(|p| p.pushdown_fields());
            if let Some(fields) = fields {
                if cfg!(debug_assertions) {
                    self.stages[1]
                        .as_any_mut()
                        .downcast_mut::<ProjectStage>()
                        .expect("checked above")
                        .mark_would_be_removed();
                }
                self.stages.remove(1);
                log_debug!("pushed {} into {}", ProjectStage::NAME, CursorSource::NAME);
                self.cursor_source().push_down_projection(fields);
            }
        }
    }

    fn cursor_source(&mut self) -> &mut CursorSource {
        self.stages[0]
            .as_any_mut()
            .downcast_mut::<CursorSource>()
            .expect("pushdown requires a cursor source")
    }

    /// Walk tail to head, each stage narrowing the required field set; the
    /// final set reaches the cursor source for selective materialization.
    fn dependency_pass(&mut self) -> Result<()> {
        let mut tracker = crate::dependency::DependencyTracker::whole_document();
        for stage in self.stages.iter_mut().rev() {
            stage.manage_dependencies(&mut tracker)?;
        }
        if let Some(first) = self.stages.first_mut() {
            if let Some(source) = first.as_any_mut().downcast_mut::<CursorSource>() {
                source.set_dependencies(tracker);
            }
        }
        Ok(())
    }

    fn link_pass(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut().skip(1) {
            stage.link()?;
        }
        Ok(())
    }

    /// Drive the last stage to exhaustion and dispose every stage in
    /// order. With `explain` set, the serialized pipeline (with execution
    /// statistics) is surfaced instead of the result documents.
    pub fn run(&mut self) -> Result<Vec<Document>> {
        self.prepare()?;
        let result = self.run_inner();
        self.dispose();
        match result {
            Ok(_) if self.options.explain => Ok(self.serialize(true)),
            other => other,
        }
    }

    fn run_inner(&mut self) -> Result<Vec<Document>> {
        let mut results = Vec::new();
        while let Some(doc) = pull_next(&mut self.stages)? {
            results.push(doc);
        }
        Ok(results)
    }

    /// Dispose every stage in order; iteration afterwards reports EOF.
    pub fn dispose(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.dispose();
        }
    }

    /// One `{name: spec}` document per stage, the engine's externalized
    /// representation.
    pub fn serialize(&self, explain: bool) -> Vec<Document> {
        self.stages.iter().map(|s| s.serialize(explain)).collect()
    }

    /// Partition into a shard-local pipeline and a router pipeline at the
    /// first splittable stage. Stages before it run on the shards; its
    /// shard half (when present) ends the shard pipeline; its router half
    /// (when present) plus the remaining suffix form the router pipeline,
    /// which is fed by a `ShardMergeSource`.
    ///
    /// Split an unprepared pipeline; both halves run their own rewrite.
    pub fn split_for_shards(mut self) -> (Pipeline, Pipeline) {
        let mut shard_stages: Vec<BoxedStage> = Vec::new();
        let mut router_stages: Vec<BoxedStage> = Vec::new();
        let mut split_done = false;

        for mut stage in self.stages.drain(..) {
            if split_done {
                router_stages.push(stage);
                continue;
            }
            if stage.as_splittable().is_none() {
                shard_stages.push(stage);
                continue;
            }
            let splittable = stage.as_splittable().expect("checked above");
            if let Some(shard_half) = splittable.shard_source() {
                shard_stages.push(shard_half);
            }
            if let Some(router_half) = splittable.router_source() {
                router_stages.push(router_half);
            }
            split_done = true;
        }

        let shard = Pipeline {
            stages: shard_stages,
            ctx: Arc::clone(&self.ctx),
            options: self.options.clone(),
            has_source: self.has_source,
            prepared: false,
        };
        let router = Pipeline {
            stages: router_stages,
            ctx: Arc::clone(&self.ctx),
            options: self.options.clone(),
            has_source: false,
            prepared: false,
        };
        (shard, router)
    }
}
