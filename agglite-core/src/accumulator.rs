// agglite-core/src/accumulator.rs
// Group accumulators with shard/router merge support

use std::collections::BTreeSet;
use std::fmt;

use crate::document::DocumentBuilder;
use crate::error::{AggLiteError, Result};
use crate::value::Value;

/// A streaming accumulator instance. Each group owns one instance per
/// accumulator specification.
///
/// Shard/router execution ships `partial()` from the shard half and feeds
/// it to `combine()` on the router. Accumulators whose kind reports
/// `!mergeable()` never see `combine`; their group runs whole on the
/// router.
pub trait Accumulator: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Fold one argument value into the state.
    fn process(&mut self, value: Value);

    fn result(&self) -> Value;

    /// State shipped by the shard half; the default is the plain result.
    fn partial(&self) -> Value {
        self.result()
    }

    /// Merge a partial produced by another instance of the same kind.
    fn combine(&mut self, partial: Value) -> Result<()>;
}

/// The recognized accumulator operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

impl AccumulatorKind {
    pub fn parse(name: &str) -> Result<AccumulatorKind> {
        match name {
            "$sum" => Ok(AccumulatorKind::Sum),
            "$avg" => Ok(AccumulatorKind::Avg),
            "$min" => Ok(AccumulatorKind::Min),
            "$max" => Ok(AccumulatorKind::Max),
            "$first" => Ok(AccumulatorKind::First),
            "$last" => Ok(AccumulatorKind::Last),
            "$push" => Ok(AccumulatorKind::Push),
            "$addToSet" => Ok(AccumulatorKind::AddToSet),
            other => Err(AggLiteError::InvalidSpec(format!(
                "Unknown accumulator: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorKind::Sum => "$sum",
            AccumulatorKind::Avg => "$avg",
            AccumulatorKind::Min => "$min",
            AccumulatorKind::Max => "$max",
            AccumulatorKind::First => "$first",
            AccumulatorKind::Last => "$last",
            AccumulatorKind::Push => "$push",
            AccumulatorKind::AddToSet => "$addToSet",
        }
    }

    /// Whether partial states from shards can be recombined. `$first` and
    /// `$last` depend on global input order and cannot.
    pub fn mergeable(&self) -> bool {
        !matches!(self, AccumulatorKind::First | AccumulatorKind::Last)
    }

    /// Fresh accumulator instance.
    pub fn make(&self) -> Box<dyn Accumulator> {
        match self {
            AccumulatorKind::Sum => Box::new(SumAccumulator::default()),
            AccumulatorKind::Avg => Box::new(AvgAccumulator::default()),
            AccumulatorKind::Min => Box::new(ExtremumAccumulator::min()),
            AccumulatorKind::Max => Box::new(ExtremumAccumulator::max()),
            AccumulatorKind::First => Box::new(FirstAccumulator::default()),
            AccumulatorKind::Last => Box::new(LastAccumulator::default()),
            AccumulatorKind::Push => Box::new(PushAccumulator::default()),
            AccumulatorKind::AddToSet => Box::new(AddToSetAccumulator::default()),
        }
    }
}

fn not_mergeable(name: &'static str) -> AggLiteError {
    AggLiteError::EvaluationError(format!("{} has no combine function", name))
}

// ============================================================================
// $sum
// ============================================================================

/// Integer and double sums are kept apart so all-integer inputs stay
/// integers. Non-numeric inputs are ignored; an empty sum is 0.
#[derive(Debug, Default)]
pub struct SumAccumulator {
    int_sum: i64,
    double_sum: f64,
    saw_double: bool,
}

impl Accumulator for SumAccumulator {
    fn name(&self) -> &'static str {
        "$sum"
    }

    fn process(&mut self, value: Value) {
        match value {
            Value::Int(n) => self.int_sum = self.int_sum.saturating_add(n),
            Value::Double(d) => {
                self.double_sum += d;
                self.saw_double = true;
            }
            Value::Decimal(d) => {
                if let Some(f) = Value::Decimal(d).as_f64() {
                    self.double_sum += f;
                    self.saw_double = true;
                }
            }
            _ => {}
        }
    }

    fn result(&self) -> Value {
        if self.saw_double {
            Value::Double(self.double_sum + self.int_sum as f64)
        } else {
            Value::Int(self.int_sum)
        }
    }

    fn combine(&mut self, partial: Value) -> Result<()> {
        self.process(partial);
        Ok(())
    }
}

// ============================================================================
// $avg
// ============================================================================

/// Averages need their running sum and count shipped together, so the
/// partial is a `{sum, count}` document rather than the plain result.
#[derive(Debug, Default)]
pub struct AvgAccumulator {
    sum: f64,
    count: i64,
}

impl Accumulator for AvgAccumulator {
    fn name(&self) -> &'static str {
        "$avg"
    }

    fn process(&mut self, value: Value) {
        if let Some(f) = value.as_f64() {
            self.sum += f;
            self.count += 1;
        }
    }

    fn result(&self) -> Value {
        if self.count > 0 {
            Value::Double(self.sum / self.count as f64)
        } else {
            Value::Null
        }
    }

    fn partial(&self) -> Value {
        let mut builder = DocumentBuilder::new();
        builder.insert("sum", Value::Double(self.sum));
        builder.insert("count", Value::Int(self.count));
        Value::Document(builder.build())
    }

    fn combine(&mut self, partial: Value) -> Result<()> {
        let doc = partial.as_document().ok_or_else(|| {
            AggLiteError::EvaluationError("$avg partial must be a {sum, count} document".to_string())
        })?;
        let sum = doc.get("sum").and_then(Value::as_f64);
        let count = doc.get("count").and_then(Value::as_i64);
        match (sum, count) {
            (Some(sum), Some(count)) => {
                self.sum += sum;
                self.count += count;
                Ok(())
            }
            _ => Err(AggLiteError::EvaluationError(
                "$avg partial must be a {sum, count} document".to_string(),
            )),
        }
    }
}

// ============================================================================
// $min / $max
// ============================================================================

#[derive(Debug)]
pub struct ExtremumAccumulator {
    name: &'static str,
    want_greater: bool,
    best: Option<Value>,
}

impl ExtremumAccumulator {
    fn min() -> ExtremumAccumulator {
        ExtremumAccumulator {
            name: "$min",
            want_greater: false,
            best: None,
        }
    }

    fn max() -> ExtremumAccumulator {
        ExtremumAccumulator {
            name: "$max",
            want_greater: true,
            best: None,
        }
    }
}

impl Accumulator for ExtremumAccumulator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process(&mut self, value: Value) {
        // Null (and therefore missing) never wins
        if value.is_null() {
            return;
        }
        let replace = match &self.best {
            None => true,
            Some(best) => {
                if self.want_greater {
                    value > *best
                } else {
                    value < *best
                }
            }
        };
        if replace {
            self.best = Some(value);
        }
    }

    fn result(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }

    fn combine(&mut self, partial: Value) -> Result<()> {
        self.process(partial);
        Ok(())
    }
}

// ============================================================================
// $first / $last
// ============================================================================

#[derive(Debug, Default)]
pub struct FirstAccumulator {
    value: Option<Value>,
}

impl Accumulator for FirstAccumulator {
    fn name(&self) -> &'static str {
        "$first"
    }

    fn process(&mut self, value: Value) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    fn result(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    fn combine(&mut self, _partial: Value) -> Result<()> {
        Err(not_mergeable("$first"))
    }
}

#[derive(Debug, Default)]
pub struct LastAccumulator {
    value: Option<Value>,
}

impl Accumulator for LastAccumulator {
    fn name(&self) -> &'static str {
        "$last"
    }

    fn process(&mut self, value: Value) {
        self.value = Some(value);
    }

    fn result(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    fn combine(&mut self, _partial: Value) -> Result<()> {
        Err(not_mergeable("$last"))
    }
}

// ============================================================================
// $push / $addToSet
// ============================================================================

#[derive(Debug, Default)]
pub struct PushAccumulator {
    items: Vec<Value>,
}

impl Accumulator for PushAccumulator {
    fn name(&self) -> &'static str {
        "$push"
    }

    fn process(&mut self, value: Value) {
        self.items.push(value);
    }

    fn result(&self) -> Value {
        Value::array(self.items.clone())
    }

    fn combine(&mut self, partial: Value) -> Result<()> {
        let items = partial.as_array().ok_or_else(|| {
            AggLiteError::EvaluationError("$push partial must be an array".to_string())
        })?;
        self.items.extend(items.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AddToSetAccumulator {
    items: BTreeSet<Value>,
}

impl Accumulator for AddToSetAccumulator {
    fn name(&self) -> &'static str {
        "$addToSet"
    }

    fn process(&mut self, value: Value) {
        self.items.insert(value);
    }

    fn result(&self) -> Value {
        // Set order is unspecified; this happens to be value order
        Value::array(self.items.iter().cloned().collect())
    }

    fn combine(&mut self, partial: Value) -> Result<()> {
        let items = partial.as_array().ok_or_else(|| {
            AggLiteError::EvaluationError("$addToSet partial must be an array".to_string())
        })?;
        for item in items {
            self.items.insert(item.clone());
        }
        Ok(())
    }
}
