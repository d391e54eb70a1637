/// Interaction corpus reader.
///
/// One record per line, nine tab-separated fields:
///   user_id, timestamp, task_type, time_step, action_index,
///   source_token, candidate_options, selected_option, feedback_label
///
/// `candidate_options` is `ALL` or a comma-separated class list. Records whose
/// selection is `NO_ANSWER_MADE` are dropped. Consecutive records of the same
/// user form one sequence.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{LearnerError, Result};
use crate::recurrence::{Sequence, Step};
use crate::vocab::FeatureSet;

pub const NO_ANSWER: &str = "NO_ANSWER_MADE";
pub const ALL_CANDIDATES: &str = "ALL";

/// Kind of exercise a record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// EX: the learner is shown an example; never scored.
    Example,
    /// MC
    MultipleChoice,
    /// MCR
    MultipleChoiceReview,
    /// TP
    TypedProduction,
    /// TPR
    TypedProductionReview,
}

impl FromStr for TaskKind {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EX" => Ok(TaskKind::Example),
            "MC" => Ok(TaskKind::MultipleChoice),
            "MCR" => Ok(TaskKind::MultipleChoiceReview),
            "TP" => Ok(TaskKind::TypedProduction),
            "TPR" => Ok(TaskKind::TypedProductionReview),
            other => Err(LearnerError::Data(format!("unknown task type {other:?}"))),
        }
    }
}

/// Feedback the system showed the learner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackLabel {
    Correct,
    Incorrect,
    /// The answer was shown; the step is not scored.
    Revealed,
    Other,
}

impl FeedbackLabel {
    pub fn parse(s: &str) -> Self {
        match s {
            "correct" => FeedbackLabel::Correct,
            "incorrect" => FeedbackLabel::Incorrect,
            "revealed" => FeedbackLabel::Revealed,
            _ => FeedbackLabel::Other,
        }
    }

    /// Only an `incorrect` label turns the target into a self-training one.
    pub fn is_positive(self) -> bool {
        self != FeedbackLabel::Incorrect
    }
}

/// One parsed corpus line.
#[derive(Clone, Debug, PartialEq)]
pub struct CorpusRecord {
    pub user: String,
    pub timestamp: String,
    pub task: TaskKind,
    pub time_step: String,
    pub action_index: String,
    pub source_token: String,
    /// None means every class is a candidate.
    pub candidates: Option<Vec<String>>,
    pub selected: String,
    pub label: FeedbackLabel,
}

impl CorpusRecord {
    /// Parse one line. Returns `Ok(None)` for a `NO_ANSWER_MADE` record.
    pub fn parse(line: &str, lineno: usize) -> Result<Option<Self>> {
        let fields: Vec<&str> = line.split('\t').map(|f| f.trim()).collect();
        if fields.len() != 9 {
            return Err(LearnerError::Data(format!(
                "corpus line {lineno}: expected 9 tab-separated fields, found {}",
                fields.len()
            )));
        }
        if fields[7] == NO_ANSWER {
            return Ok(None);
        }
        let task: TaskKind = fields[2]
            .parse()
            .map_err(|e: LearnerError| LearnerError::Data(format!("corpus line {lineno}: {e}")))?;
        let candidates = if fields[6] == ALL_CANDIDATES {
            None
        } else {
            Some(fields[6].split(',').map(|c| c.trim().to_string()).collect())
        };
        Ok(Some(CorpusRecord {
            user: fields[0].to_string(),
            timestamp: fields[1].to_string(),
            task,
            time_step: fields[3].to_string(),
            action_index: fields[4].to_string(),
            source_token: fields[5].to_string(),
            candidates,
            selected: fields[7].to_string(),
            label: FeedbackLabel::parse(fields[8]),
        }))
    }

    /// Resolve labels against the vocabularies.
    pub fn to_step(&self, fs: &FeatureSet, lineno: usize) -> Result<Step> {
        let event = fs.events.get(&self.source_token).ok_or_else(|| {
            LearnerError::Data(format!("corpus line {lineno}: unknown event {:?}", self.source_token))
        })?;
        let class = |label: &str| {
            fs.classes.get(label).ok_or_else(|| {
                LearnerError::Data(format!("corpus line {lineno}: unknown class {label:?}"))
            })
        };
        let selected = class(self.selected.as_str())?;
        let mask = match &self.candidates {
            None => vec![true; fs.classes.len()],
            Some(list) => {
                let mut mask = vec![false; fs.classes.len()];
                for c in list {
                    mask[class(c.as_str())?] = true;
                }
                mask
            }
        };
        Ok(Step {
            event,
            selected,
            mask,
            feedback: self.label.is_positive(),
            task: self.task,
            label: self.label,
            true_class: fs.truth.get(&event).copied(),
        })
    }
}

/// Read a corpus into per-user sequences, in file order.
pub fn parse_corpus<R: BufRead>(reader: R, fs: &FeatureSet) -> Result<Vec<Sequence>> {
    let mut sequences: Vec<Sequence> = Vec::new();
    let mut skipped = 0usize;
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let lineno = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Some(record) = CorpusRecord::parse(&line, lineno)? else {
            skipped += 1;
            continue;
        };
        let step = record.to_step(fs, lineno)?;
        match sequences.last_mut() {
            Some(seq) if seq.user == record.user => seq.steps.push(step),
            _ => sequences.push(Sequence { user: record.user, steps: vec![step] }),
        }
    }
    debug!(skipped, "dropped records without an answer");
    Ok(sequences)
}

pub fn read_corpus(path: &Path, fs: &FeatureSet) -> Result<Vec<Sequence>> {
    let sequences = parse_corpus(BufReader::new(File::open(path)?), fs)?;
    info!(
        path = %path.display(),
        sequences = sequences.len(),
        steps = sequences.iter().map(|s| s.steps.len()).sum::<usize>(),
        "loaded corpus"
    );
    Ok(sequences)
}
