use std::collections::HashMap;
use std::fs::read_to_string;
use std::path::Path;

/// Class index to label lookup.
///
/// Label files hold one class per line, either `<index> <name>` or just
/// `<name>` (the line position is then the index). Blank lines are skipped.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    labels: HashMap<i32, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("cannot read label file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("label line {line} has a bad class index: {text:?}")]
    BadIndex { line: usize, text: String },
}

impl LabelMap {
    pub fn from_file(path: &Path) -> Result<Self, LabelError> {
        let text = read_to_string(path).map_err(|source| LabelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, LabelError> {
        let mut labels = HashMap::new();
        let mut next_index = 0;
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (index, name) = match line.split_once(char::is_whitespace) {
                Some((head, rest)) if head.chars().all(|c| c.is_ascii_digit()) => {
                    let index = head.parse::<i32>().map_err(|_| LabelError::BadIndex {
                        line: line_no + 1,
                        text: line.to_string(),
                    })?;
                    (index, rest.trim())
                }
                _ => (next_index, line),
            };
            labels.insert(index, name.to_string());
            next_index = index + 1;
        }
        Ok(Self { labels })
    }

    pub fn lookup(&self, class_num: i32) -> Option<&str> {
        self.labels.get(&class_num).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for LabelMap {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let labels = iter
            .into_iter()
            .enumerate()
            .map(|(index, name)| (index as i32, name.as_ref().to_string()))
            .collect();
        Self { labels }
    }
}
