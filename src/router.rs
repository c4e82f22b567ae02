use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{Classification, RequestState};

/// Routing decision: the next step to run, or end of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Step(String),
    Terminal,
}

/// One routing rule: matches a classification (or any, when `None`) and
/// names where to go.
#[derive(Debug, Clone)]
struct Rule {
    pattern: Option<Classification>,
    target: Route,
}

/// Lookup-table router.
///
/// `next` is a pure function of the current step name and the state's
/// classification field. Rules for a step are checked in insertion order;
/// `None` patterns are wildcards. An unset classification only ever
/// matches a wildcard, so the fallback edge of each step is the
/// conservative one.
#[derive(Debug, Clone, Default)]
pub struct Router {
    table: HashMap<String, Vec<Rule>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// The canonical triage policy:
    ///
    /// - triage → summary when `simple`, retrieval otherwise
    /// - retrieval → summary when `retrieval`, reasoning otherwise
    /// - reasoning → summary
    /// - summary → terminal
    ///
    /// The "otherwise" edges deliberately take the full pipeline, so an
    /// unclassified or garbled query gets the most thorough treatment
    /// instead of a routing failure.
    pub fn canonical() -> Self {
        Self::builder()
            .when("triage", Classification::Simple, "summary")
            .otherwise("triage", "retrieval")
            .when("retrieval", Classification::Retrieval, "summary")
            .otherwise("retrieval", "reasoning")
            .otherwise("reasoning", "summary")
            .terminal("summary")
            .build()
    }

    /// Where to go after `current`. Unknown step names terminate with a
    /// warning rather than failing the request.
    pub fn next(&self, current: &str, state: &RequestState) -> Route {
        let Some(rules) = self.table.get(current) else {
            warn!(step = current, "no routing rules for step, terminating");
            return Route::Terminal;
        };
        for rule in rules {
            let matches = match rule.pattern {
                None => true,
                Some(pattern) => state.classification == Some(pattern),
            };
            if matches {
                debug!(
                    step = current,
                    classification = ?state.classification,
                    target = ?rule.target,
                    "routing decision"
                );
                return rule.target.clone();
            }
        }
        warn!(
            step = current,
            classification = ?state.classification,
            "no routing rule matched, terminating"
        );
        Route::Terminal
    }

    /// Step names this table can route to (build-time validation hook).
    pub(crate) fn targets(&self) -> impl Iterator<Item = &str> {
        self.table.values().flatten().filter_map(|r| match &r.target {
            Route::Step(name) => Some(name.as_str()),
            Route::Terminal => None,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RouterBuilder {
    table: HashMap<String, Vec<Rule>>,
}

impl RouterBuilder {
    /// After `from`, go to `to` when the classification equals `pattern`.
    pub fn when(mut self, from: &str, pattern: Classification, to: &str) -> Self {
        self.table.entry(from.to_string()).or_default().push(Rule {
            pattern: Some(pattern),
            target: Route::Step(to.to_string()),
        });
        self
    }

    /// After `from`, go to `to` regardless of classification (wildcard).
    pub fn otherwise(mut self, from: &str, to: &str) -> Self {
        self.table.entry(from.to_string()).or_default().push(Rule {
            pattern: None,
            target: Route::Step(to.to_string()),
        });
        self
    }

    /// After `from`, the pipeline ends.
    pub fn terminal(mut self, from: &str) -> Self {
        self.table.entry(from.to_string()).or_default().push(Rule {
            pattern: None,
            target: Route::Terminal,
        });
        self
    }

    pub fn build(self) -> Router {
        Router { table: self.table }
    }
}
