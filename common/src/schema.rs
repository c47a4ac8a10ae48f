//! Declarative schemas for the records kept in the store, and the validator
//! that checks candidate records against them.
//!
//! Validation works on the JSON form of a record so that it catches type
//! errors in documents that never went through our own types (records read
//! back from the store, or written by other components). Every violated
//! constraint is reported, not just the first.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/////////////////////////////////////////////////////////////////////////////
// Violations
/////////////////////////////////////////////////////////////////////////////

/// The kinds of record the validator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Job,
    TaskGroup,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Job => write!(f, "job"),
            RecordKind::TaskGroup => write!(f, "task group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Missing,
    WrongType { expected: &'static str },
    NotInEnum { allowed: &'static [&'static str] },
    TooFewItems { min: usize, actual: usize },
    BelowMinimum { minimum: i64 },
    BadFormat { format: &'static str },
    Inconsistent(&'static str),
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Missing => write!(f, "required"),
            Problem::WrongType { expected } => write!(f, "expected {}", expected),
            Problem::NotInEnum { allowed } => write!(f, "must be one of {}", allowed.join(", ")),
            Problem::TooFewItems { min, actual } => {
                write!(f, "needs at least {} item(s), found {}", min, actual)
            }
            Problem::BelowMinimum { minimum } => write!(f, "must be at least {}", minimum),
            Problem::BadFormat { format } => write!(f, "not a valid {}", format),
            Problem::Inconsistent(why) => write!(f, "{}", why),
        }
    }
}

/// One violated constraint, located by a path like `phases[0].exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub problem: Problem,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.problem)
        } else {
            write!(f, "{}: {}", self.path, self.problem)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} record: {}", summarize(.violations))]
pub struct ValidationError {
    pub kind: RecordKind,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Whether some violation is reported at exactly `path`.
    pub fn has_violation_at(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/////////////////////////////////////////////////////////////////////////////
// Schema definitions
/////////////////////////////////////////////////////////////////////////////

enum Rule {
    String,
    DateTime,
    Boolean,
    Integer { minimum: i64 },
    Enum(&'static [&'static str]),
    Array { items: &'static Rule, min_items: usize },
    Object(&'static [Field]),
    /// Any JSON object; contents are not inspected.
    OpaqueObject,
}

struct Field {
    name: &'static str,
    required: bool,
    rule: &'static Rule,
}

static STRING: Rule = Rule::String;
static DATE_TIME: Rule = Rule::DateTime;
static BOOLEAN: Rule = Rule::Boolean;
static OPAQUE: Rule = Rule::OpaqueObject;
static COUNTER: Rule = Rule::Integer { minimum: 0 };
static POSITIVE: Rule = Rule::Integer { minimum: 1 };
static STRING_ARRAY: Rule = Rule::Array { items: &STRING, min_items: 0 };
static INPUT_KEYS: Rule = Rule::Array { items: &STRING, min_items: 1 };

static PHASE_TYPE: Rule = Rule::Enum(&["generic", "storage-map", "reduce"]);
static JOB_STATE: Rule = Rule::Enum(&["queued", "running", "done"]);
static TASK_GROUP_STATE: Rule = Rule::Enum(&["dispatched", "running", "done"]);
static OUTCOME: Rule = Rule::Enum(&["ok", "fail"]);

static PHASE_FIELDS: [Field; 5] = [
    Field { name: "type", required: false, rule: &PHASE_TYPE },
    Field { name: "assets", required: false, rule: &STRING_ARRAY },
    Field { name: "exec", required: true, rule: &STRING },
    Field { name: "uarg", required: false, rule: &OPAQUE },
    Field { name: "count", required: false, rule: &POSITIVE },
];
static PHASE: Rule = Rule::Object(&PHASE_FIELDS);
static PHASES: Rule = Rule::Array { items: &PHASE, min_items: 1 };

static STATS_FIELDS: [Field; 7] = [
    Field { name: "nAssigns", required: false, rule: &COUNTER },
    Field { name: "nInputsRead", required: false, rule: &COUNTER },
    Field { name: "nJobOutputs", required: false, rule: &COUNTER },
    Field { name: "nTasksDispatched", required: false, rule: &COUNTER },
    Field { name: "nTasksCommittedOk", required: false, rule: &COUNTER },
    Field { name: "nTasksCommittedFail", required: false, rule: &COUNTER },
    Field { name: "nErrors", required: false, rule: &COUNTER },
];
static STATS: Rule = Rule::Object(&STATS_FIELDS);

// The one-key minimum on inputKeys is waived for streaming jobs, so it is
// checked separately in `check_job`.
static JOB_FIELDS: [Field; 15] = [
    Field { name: "jobId", required: true, rule: &STRING },
    Field { name: "jobName", required: true, rule: &STRING },
    Field { name: "phases", required: true, rule: &PHASES },
    Field { name: "inputKeys", required: true, rule: &STRING_ARRAY },
    Field { name: "inputStreaming", required: false, rule: &BOOLEAN },
    Field { name: "createTime", required: true, rule: &DATE_TIME },
    Field { name: "state", required: true, rule: &JOB_STATE },
    Field { name: "doneKeys", required: true, rule: &STRING_ARRAY },
    Field { name: "outputKeys", required: true, rule: &STRING_ARRAY },
    Field { name: "discardedKeys", required: true, rule: &STRING_ARRAY },
    Field { name: "timeInputDone", required: false, rule: &DATE_TIME },
    Field { name: "timeCancelled", required: false, rule: &DATE_TIME },
    Field { name: "finishTime", required: false, rule: &DATE_TIME },
    Field { name: "worker", required: false, rule: &STRING },
    Field { name: "stats", required: false, rule: &STATS },
];
static JOB: Rule = Rule::Object(&JOB_FIELDS);

static ERROR_FIELDS: [Field; 2] = [
    Field { name: "code", required: true, rule: &STRING },
    Field { name: "message", required: true, rule: &STRING },
];
static ERROR: Rule = Rule::Object(&ERROR_FIELDS);

static RESULT_FIELDS: [Field; 9] = [
    Field { name: "input", required: true, rule: &STRING },
    Field { name: "machine", required: false, rule: &STRING },
    Field { name: "outputs", required: true, rule: &STRING_ARRAY },
    Field { name: "result", required: true, rule: &OUTCOME },
    Field { name: "partials", required: false, rule: &STRING_ARRAY },
    Field { name: "discarded", required: false, rule: &STRING_ARRAY },
    Field { name: "startTime", required: false, rule: &DATE_TIME },
    Field { name: "doneTime", required: false, rule: &DATE_TIME },
    Field { name: "error", required: false, rule: &ERROR },
];
static RESULT: Rule = Rule::Object(&RESULT_FIELDS);
static RESULTS: Rule = Rule::Array { items: &RESULT, min_items: 0 };

static TASK_GROUP_FIELDS: [Field; 9] = [
    Field { name: "jobId", required: true, rule: &STRING },
    Field { name: "taskGroupId", required: true, rule: &STRING },
    Field { name: "host", required: true, rule: &STRING },
    Field { name: "inputKeys", required: true, rule: &INPUT_KEYS },
    Field { name: "phase", required: true, rule: &PHASE },
    Field { name: "phaseNum", required: true, rule: &COUNTER },
    Field { name: "state", required: true, rule: &TASK_GROUP_STATE },
    Field { name: "results", required: true, rule: &RESULTS },
    Field { name: "partition", required: false, rule: &COUNTER },
];
static TASK_GROUP: Rule = Rule::Object(&TASK_GROUP_FIELDS);

/////////////////////////////////////////////////////////////////////////////
// Validation
/////////////////////////////////////////////////////////////////////////////

/// Check a candidate record of the given kind.
///
/// Pure: the same input always produces the same answer.
pub fn validate(kind: RecordKind, record: &Value) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    match kind {
        RecordKind::Job => {
            check(&JOB, record, "", &mut violations);
            if let Some(fields) = record.as_object() {
                check_job(fields, &mut violations);
            }
        }
        RecordKind::TaskGroup => {
            check(&TASK_GROUP, record, "", &mut violations);
            if let Some(fields) = record.as_object() {
                check_task_group(fields, &mut violations);
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { kind, violations })
    }
}

/// Serialize `record` and validate the result.
pub fn validate_serialize<T: Serialize>(kind: RecordKind, record: &T) -> Result<(), ValidationError> {
    match serde_json::to_value(record) {
        Ok(value) => validate(kind, &value),
        Err(_) => Err(ValidationError {
            kind,
            violations: vec![Violation {
                path: String::new(),
                problem: Problem::WrongType { expected: "object" },
            }],
        }),
    }
}

fn push(out: &mut Vec<Violation>, path: &str, problem: Problem) {
    out.push(Violation {
        path: path.to_string(),
        problem,
    });
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn check(rule: &Rule, value: &Value, path: &str, out: &mut Vec<Violation>) {
    match rule {
        Rule::String => {
            if !value.is_string() {
                push(out, path, Problem::WrongType { expected: "string" });
            }
        }
        Rule::DateTime => match value.as_str() {
            Some(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {}
            Some(_) => push(out, path, Problem::BadFormat { format: "date-time" }),
            None => push(out, path, Problem::WrongType { expected: "date-time string" }),
        },
        Rule::Boolean => {
            if !value.is_boolean() {
                push(out, path, Problem::WrongType { expected: "boolean" });
            }
        }
        Rule::Integer { minimum } => {
            if let Some(n) = value.as_i64() {
                if n < *minimum {
                    push(out, path, Problem::BelowMinimum { minimum: *minimum });
                }
            } else if value.as_u64().is_none() {
                push(out, path, Problem::WrongType { expected: "integer" });
            }
        }
        Rule::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            Some(_) => push(out, path, Problem::NotInEnum { allowed: *allowed }),
            None => push(out, path, Problem::WrongType { expected: "string" }),
        },
        Rule::Array { items, min_items } => match value.as_array() {
            Some(array) => {
                if array.len() < *min_items {
                    push(
                        out,
                        path,
                        Problem::TooFewItems {
                            min: *min_items,
                            actual: array.len(),
                        },
                    );
                }
                for (i, item) in array.iter().enumerate() {
                    check(items, item, &format!("{}[{}]", path, i), out);
                }
            }
            None => push(out, path, Problem::WrongType { expected: "array" }),
        },
        Rule::Object(fields) => match value.as_object() {
            Some(map) => {
                for field in fields.iter() {
                    let field_path = join(path, field.name);
                    match map.get(field.name) {
                        None | Some(Value::Null) => {
                            if field.required {
                                push(out, &field_path, Problem::Missing);
                            }
                        }
                        Some(v) => check(field.rule, v, &field_path, out),
                    }
                }
            }
            None => push(out, path, Problem::WrongType { expected: "object" }),
        },
        Rule::OpaqueObject => {
            if !value.is_object() {
                push(out, path, Problem::WrongType { expected: "object" });
            }
        }
    }
}

fn check_job(fields: &Map<String, Value>, out: &mut Vec<Violation>) {
    let streaming = fields
        .get("inputStreaming")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(keys) = fields.get("inputKeys").and_then(Value::as_array) {
        if keys.is_empty() && !streaming {
            push(out, "inputKeys", Problem::TooFewItems { min: 1, actual: 0 });
        }
    }

    let state = fields.get("state").and_then(Value::as_str);
    let has_worker = fields
        .get("worker")
        .and_then(Value::as_str)
        .map_or(false, |w| !w.is_empty());
    let has_finish = fields.get("finishTime").map_or(false, |v| !v.is_null());

    if matches!(state, Some("running") | Some("done")) && !has_worker {
        push(out, "worker", Problem::Inconsistent("a claimed job must name its worker"));
    }
    match state {
        Some("done") if !has_finish => {
            push(out, "finishTime", Problem::Inconsistent("a done job must have a finish time"))
        }
        Some("queued") | Some("running") if has_finish => push(
            out,
            "finishTime",
            Problem::Inconsistent("only a done job has a finish time"),
        ),
        _ => {}
    }
}

fn check_task_group(fields: &Map<String, Value>, out: &mut Vec<Violation>) {
    let Some(results) = fields.get("results").and_then(Value::as_array) else {
        return;
    };

    for (i, result) in results.iter().enumerate() {
        let Some(result) = result.as_object() else {
            continue;
        };
        let failed = result.get("result").and_then(Value::as_str) == Some("fail");
        let has_error = result.get("error").map_or(false, |v| !v.is_null());

        if failed && !has_error {
            push(
                out,
                &format!("results[{}].error", i),
                Problem::Inconsistent("a failed result must carry an error"),
            );
        } else if !failed && has_error {
            push(
                out,
                &format!("results[{}].error", i),
                Problem::Inconsistent("only a failed result carries an error"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn job() -> Value {
        json!({
            "jobId": "j1",
            "jobName": "wc",
            "phases": [ { "type": "storage-map", "exec": "wc" } ],
            "inputKeys": [ "/poseidon/stor/obj1" ],
            "createTime": "2024-05-01T10:00:00Z",
            "state": "queued",
            "doneKeys": [],
            "outputKeys": [],
            "discardedKeys": []
        })
    }

    fn task_group() -> Value {
        json!({
            "jobId": "j1",
            "taskGroupId": "tg1",
            "host": "node0",
            "inputKeys": [ "/poseidon/stor/obj1" ],
            "phase": { "type": "storage-map", "exec": "wc" },
            "phaseNum": 0,
            "state": "done",
            "results": [ {
                "input": "/poseidon/stor/obj1",
                "outputs": [ "/out/obj1.0" ],
                "result": "ok"
            } ]
        })
    }

    #[test]
    fn accepts_well_formed_records() {
        assert!(validate(RecordKind::Job, &job()).is_ok());
        assert!(validate(RecordKind::TaskGroup, &task_group()).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let record = json!({
            "jobName": 7,
            "phases": [],
            "inputKeys": [],
            "createTime": "yesterday",
            "state": "paused",
            "doneKeys": [],
            "outputKeys": [],
            "discardedKeys": []
        });

        let err = validate(RecordKind::Job, &record).unwrap_err();

        assert_eq!(err.kind, RecordKind::Job);
        assert!(err.has_violation_at("jobId"));
        assert!(err.has_violation_at("jobName"));
        assert!(err.has_violation_at("phases"));
        assert!(err.has_violation_at("inputKeys"));
        assert!(err.has_violation_at("createTime"));
        assert!(err.has_violation_at("state"));
        assert_eq!(
            err.violations
                .iter()
                .filter(|v| v.path == "jobId")
                .count(),
            1
        );
    }

    #[test]
    fn nested_violations_carry_paths() {
        let mut record = job();
        record["phases"] = json!([ { "type": "storage-map", "exec": "wc" }, { "type": "shuffle" } ]);

        let err = validate(RecordKind::Job, &record).unwrap_err();

        assert!(err.has_violation_at("phases[1].exec"));
        assert!(err.has_violation_at("phases[1].type"));
        assert!(!err.has_violation_at("phases[0].exec"));
    }

    #[test]
    fn reduce_is_a_valid_phase_type() {
        let mut record = job();
        record["phases"] = json!([ { "type": "reduce", "exec": "wc", "count": 2 } ]);
        assert!(validate(RecordKind::Job, &record).is_ok());

        record["phases"][0]["count"] = json!(0);
        let err = validate(RecordKind::Job, &record).unwrap_err();
        assert_eq!(err.violations[0].problem, Problem::BelowMinimum { minimum: 1 });
    }

    #[test]
    fn empty_input_needs_streaming_marker() {
        let mut record = job();
        record["inputKeys"] = json!([]);
        let err = validate(RecordKind::Job, &record).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation {
                path: "inputKeys".into(),
                problem: Problem::TooFewItems { min: 1, actual: 0 },
            }]
        );

        record["inputStreaming"] = json!(true);
        assert!(validate(RecordKind::Job, &record).is_ok());
    }

    #[test]
    fn claimed_job_needs_worker_and_done_job_needs_finish_time() {
        let mut record = job();
        record["state"] = json!("done");

        let err = validate(RecordKind::Job, &record).unwrap_err();
        assert!(err.has_violation_at("worker"));
        assert!(err.has_violation_at("finishTime"));

        record["worker"] = json!("w1");
        record["finishTime"] = json!("2024-05-01T10:05:00Z");
        assert!(validate(RecordKind::Job, &record).is_ok());

        record["state"] = json!("running");
        let err = validate(RecordKind::Job, &record).unwrap_err();
        assert!(err.has_violation_at("finishTime"));
    }

    #[test]
    fn error_present_iff_failed() {
        let mut record = task_group();
        record["results"][0]["result"] = json!("fail");
        let err = validate(RecordKind::TaskGroup, &record).unwrap_err();
        assert!(err.has_violation_at("results[0].error"));

        record["results"][0]["error"] = json!({ "code": "EJ_USER" });
        let err = validate(RecordKind::TaskGroup, &record).unwrap_err();
        assert!(err.has_violation_at("results[0].error.message"));

        record["results"][0]["error"]["message"] = json!("user command or child process dumped core");
        assert!(validate(RecordKind::TaskGroup, &record).is_ok());

        record["results"][0]["result"] = json!("ok");
        assert!(validate(RecordKind::TaskGroup, &record).is_err());
    }

    #[test]
    fn task_group_types_are_checked() {
        let mut record = task_group();
        record["phaseNum"] = json!(-1);
        record["inputKeys"] = json!([]);
        record["results"] = json!("none");

        let err = validate(RecordKind::TaskGroup, &record).unwrap_err();
        assert!(err.has_violation_at("phaseNum"));
        assert!(err.has_violation_at("inputKeys"));
        assert!(err.has_violation_at("results"));
    }

    #[test]
    fn validation_is_idempotent() {
        let mut record = job();
        record["state"] = json!("bogus");

        let first = validate(RecordKind::Job, &record);
        let second = validate(RecordKind::Job, &record);
        assert_eq!(first, second);
        assert!(validate(RecordKind::Job, &job()).is_ok());
        assert!(validate(RecordKind::Job, &job()).is_ok());
    }

    #[test]
    fn non_object_records_are_rejected() {
        let err = validate(RecordKind::TaskGroup, &json!([1, 2])).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].path, "");
    }

    #[test]
    fn typed_records_validate() {
        let job = crate::Job::with_id("j1", "wc", vec![crate::Phase::map("wc")], vec!["/a".into()]);
        assert!(job.validate().is_ok());

        let empty = crate::Job::with_id("j2", "wc", vec![crate::Phase::map("wc")], vec![]);
        assert!(empty.validate().is_err());
        assert!(empty.streaming().validate().is_ok());
    }
}
