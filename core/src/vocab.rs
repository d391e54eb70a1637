/// Vocabularies and feature-file loading.
///
/// File formats (UTF-8, tab separated, blank lines ignored):
///   feat2id:     name<TAB>id                   D = number of entries
///   actions:     class label                   class id = line order
///   event2feats: event<TAB>class<TAB>id:val id:val ...
///   truth:       event<TAB>class               (optional)
///
/// Events are numbered in order of first appearance in event2feats.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::error::{LearnerError, Result};
use crate::features::{FeatureTensor, SparseFeatures};

/// Bidirectional label <-> id map. Ids are dense and assigned in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vocabulary {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from distinct labels; a repeated label is a `Config` error.
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Vocabulary::new();
        for label in labels {
            let label = label.into();
            if vocab.index.contains_key(&label) {
                return Err(LearnerError::Config(format!("duplicate label {label:?}")));
            }
            vocab.insert(&label);
        }
        Ok(vocab)
    }

    /// Id of `label`, adding it if unseen.
    pub fn insert(&mut self, label: &str) -> usize {
        if let Some(&id) = self.index.get(label) {
            return id;
        }
        let id = self.labels.len();
        self.labels.push(label.to_string());
        self.index.insert(label.to_string(), id);
        id
    }

    pub fn get(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Paths of the four feature files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureFiles {
    pub feat2id: PathBuf,
    pub actions: PathBuf,
    pub event2feats: PathBuf,
    #[serde(default)]
    pub truth: Option<PathBuf>,
}

/// Everything loaded from the feature files.
#[derive(Clone, Debug)]
pub struct FeatureSet {
    pub feature_names: Vocabulary,
    pub classes: Vocabulary,
    pub events: Vocabulary,
    pub features: FeatureTensor,
    /// event id -> correct class id.
    pub truth: HashMap<usize, usize>,
}

fn lines<R: BufRead>(reader: R) -> impl Iterator<Item = Result<(usize, String)>> {
    reader
        .lines()
        .enumerate()
        .map(|(i, l)| l.map(|l| (i + 1, l)).map_err(LearnerError::from))
        .filter(|r| !matches!(r, Ok((_, l)) if l.trim().is_empty()))
}

fn split_tabs<'a>(line: &'a str, n: usize, file: &str, lineno: usize) -> Result<Vec<&'a str>> {
    let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
    if fields.len() != n {
        return Err(LearnerError::Config(format!(
            "{file} line {lineno}: expected {n} tab-separated fields, found {}",
            fields.len()
        )));
    }
    Ok(fields)
}

/// Parse a feat2id file into a feature-name vocabulary with ids as given.
pub fn parse_feat2id<R: BufRead>(reader: R) -> Result<Vocabulary> {
    let mut pairs = Vec::new();
    for line in lines(reader) {
        let (lineno, line) = line?;
        let fields = split_tabs(&line, 2, "feat2id", lineno)?;
        let id: usize = fields[1].trim().parse().map_err(|_| {
            LearnerError::Config(format!("feat2id line {lineno}: bad feature id {:?}", fields[1]))
        })?;
        pairs.push((fields[0].trim().to_string(), id, lineno));
    }

    let dim = pairs.len();
    let mut slots: Vec<Option<String>> = vec![None; dim];
    for (name, id, lineno) in pairs {
        if id >= dim {
            return Err(LearnerError::Config(format!(
                "feat2id line {lineno}: feature id {id} out of range for {dim} features"
            )));
        }
        if slots[id].is_some() {
            return Err(LearnerError::Config(format!("feat2id line {lineno}: duplicate feature id {id}")));
        }
        slots[id] = Some(name);
    }
    // every slot is filled: dim entries, distinct ids, all < dim
    Vocabulary::from_labels(slots.into_iter().flatten())
}

/// Parse an actions file: one class label per line.
pub fn parse_actions<R: BufRead>(reader: R) -> Result<Vocabulary> {
    let mut labels = Vec::new();
    for line in lines(reader) {
        let (_, line) = line?;
        labels.push(line.trim().to_string());
    }
    Vocabulary::from_labels(labels)
}

/// Parse event2feats into an event vocabulary and sparse entries.
pub fn parse_event2feats<R: BufRead>(
    reader: R,
    classes: &Vocabulary,
) -> Result<(Vocabulary, HashMap<(usize, usize), SparseFeatures>)> {
    let mut events = Vocabulary::new();
    let mut entries: HashMap<(usize, usize), SparseFeatures> = HashMap::new();
    for line in lines(reader) {
        let (lineno, line) = line?;
        let fields = split_tabs(&line, 3, "event2feats", lineno)?;
        let event = events.insert(fields[0].trim());
        let class = classes.get(fields[1].trim()).ok_or_else(|| {
            LearnerError::Config(format!("event2feats line {lineno}: unknown class {:?}", fields[1]))
        })?;
        let entry = entries.entry((event, class)).or_default();
        for pair in fields[2].split_whitespace() {
            let bad = || LearnerError::Config(format!("event2feats line {lineno}: bad feature pair {pair:?}"));
            let (id, val) = pair.split_once(':').ok_or_else(bad)?;
            entry.indices.push(id.parse().map_err(|_| bad())?);
            entry.values.push(val.parse().map_err(|_| bad())?);
        }
    }
    Ok((events, entries))
}

/// Parse a truth file into event id -> class id.
pub fn parse_truth<R: BufRead>(
    reader: R,
    events: &Vocabulary,
    classes: &Vocabulary,
) -> Result<HashMap<usize, usize>> {
    let mut truth = HashMap::new();
    for line in lines(reader) {
        let (lineno, line) = line?;
        let fields = split_tabs(&line, 2, "truth", lineno)?;
        let event = events.get(fields[0].trim()).ok_or_else(|| {
            LearnerError::Config(format!("truth line {lineno}: unknown event {:?}", fields[0]))
        })?;
        let class = classes.get(fields[1].trim()).ok_or_else(|| {
            LearnerError::Config(format!("truth line {lineno}: unknown class {:?}", fields[1]))
        })?;
        truth.insert(event, class);
    }
    Ok(truth)
}

fn open(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

impl FeatureSet {
    /// Assemble a feature set from already-open readers.
    pub fn from_readers<R: BufRead>(
        feat2id: R,
        actions: R,
        event2feats: R,
        truth: Option<R>,
    ) -> Result<Self> {
        let feature_names = parse_feat2id(feat2id)?;
        let classes = parse_actions(actions)?;
        let (events, entries) = parse_event2feats(event2feats, &classes)?;
        let features = FeatureTensor::from_sparse(events.len(), classes.len(), feature_names.len(), &entries)?;
        let truth = match truth {
            Some(r) => parse_truth(r, &events, &classes)?,
            None => HashMap::new(),
        };
        Ok(FeatureSet { feature_names, classes, events, features, truth })
    }

    pub fn load(files: &FeatureFiles) -> Result<Self> {
        let truth = files.truth.as_deref().map(open).transpose()?;
        let set = Self::from_readers(
            open(&files.feat2id)?,
            open(&files.actions)?,
            open(&files.event2feats)?,
            truth,
        )?;
        info!(
            features = set.feature_names.len(),
            classes = set.classes.len(),
            events = set.events.len(),
            nnz = set.features.nnz(),
            "loaded feature files"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_vocabulary_insert_get() {
        let mut v = Vocabulary::new();
        assert_eq!(v.insert("a"), 0);
        assert_eq!(v.insert("b"), 1);
        assert_eq!(v.insert("a"), 0);
        assert_eq!(v.get("b"), Some(1));
        assert_eq!(v.label(1), Some("b"));
        assert_eq!(v.get("c"), None);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_from_labels_rejects_duplicates() {
        assert!(Vocabulary::from_labels(["x", "y", "x"]).is_err());
    }

    #[test]
    fn test_feat2id_uses_given_ids() {
        let v = parse_feat2id(Cursor::new("b\t1\na\t0\n\nc\t2\n")).unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v.get("a"), Some(0));
        assert_eq!(v.get("b"), Some(1));
    }

    #[test]
    fn test_feat2id_errors() {
        let err = parse_feat2id(Cursor::new("a\t0\nb\t2\n")).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        let err = parse_feat2id(Cursor::new("a\t0\nb\t0\n")).unwrap_err();
        assert!(err.to_string().contains("duplicate feature id"));
        let err = parse_feat2id(Cursor::new("a 0\n")).unwrap_err();
        assert!(matches!(err, LearnerError::Config(_)));
        assert!(parse_feat2id(Cursor::new("a\tzero\n")).is_err());
    }

    #[test]
    fn test_event2feats() {
        let classes = parse_actions(Cursor::new("house\ncat\n")).unwrap();
        let text = "Haus\thouse\t0:1.0 2:0.5\nKatze\tcat\t1:1\nHaus\tcat\t\n";
        let (events, entries) = parse_event2feats(Cursor::new(text), &classes).unwrap();
        assert_eq!(events.get("Haus"), Some(0));
        assert_eq!(events.get("Katze"), Some(1));
        assert_eq!(entries[&(0, 0)], SparseFeatures::new(vec![0, 2], vec![1.0, 0.5]));
        assert!(entries[&(0, 1)].indices.is_empty());
    }

    #[test]
    fn test_event2feats_unknown_class() {
        let classes = parse_actions(Cursor::new("house\n")).unwrap();
        let err = parse_event2feats(Cursor::new("Haus\tdog\t0:1\n"), &classes).unwrap_err();
        assert!(err.to_string().contains("unknown class"));
        let err = parse_event2feats(Cursor::new("Haus\thouse\t0-1\n"), &classes).unwrap_err();
        assert!(err.to_string().contains("bad feature pair"));
    }

    #[test]
    fn test_feature_set_from_readers() {
        let set = FeatureSet::from_readers(
            Cursor::new("f0\t0\nf1\t1\nf2\t2\n"),
            Cursor::new("house\ncat\n"),
            Cursor::new("Haus\thouse\t0:1 1:1\nHaus\tcat\t2:1\nKatze\tcat\t1:1\n"),
            Some(Cursor::new("Haus\thouse\nKatze\tcat\n")),
        )
        .unwrap();
        assert_eq!(set.features.feature_dim(), 3);
        assert_eq!(set.features.num_classes(), 2);
        assert_eq!(set.features.num_events(), 2);
        assert_eq!(set.features.vector(0, 0), &[1.0, 1.0, 0.0]);
        assert_eq!(set.truth[&1], 1);
    }

    #[test]
    fn test_feature_index_beyond_feat2id() {
        let err = FeatureSet::from_readers(
            Cursor::new("f0\t0\n"),
            Cursor::new("house\n"),
            Cursor::new("Haus\thouse\t3:1\n"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LearnerError::Config(_)));
    }
}
