//! Predicted file footprints and conflict-free wave splitting.
//!
//! Estimation is a heuristic: false negatives are accepted (they surface as
//! merge conflicts later), false positives only cost parallelism.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::Task;

/// Extensions that make a bare token look like a source path.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "rs", "ts", "tsx", "js", "jsx", "json", "md", "yaml", "yml", "toml", "go", "java", "c",
    "h", "cpp", "hpp", "rb", "sh", "sql", "html", "css",
];

static PATH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./-]+").expect("path token regex"));

/// Predicts the set of files a task will touch.
pub trait TouchEstimator: Send + Sync {
    fn estimate_touched_files(&self, task: &Task) -> BTreeSet<String>;
}

/// Default estimator: collects path-shaped tokens from the task text.
///
/// A token counts when it contains `/` with a non-empty segment, or ends in a
/// known source extension. URLs and bare punctuation are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTokenEstimator;

impl TouchEstimator for PathTokenEstimator {
    fn estimate_touched_files(&self, task: &Task) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        let texts = [task.title.as_str(), task.description.as_str()]
            .into_iter()
            .chain(task.acceptance_criteria.iter().map(String::as_str));
        for text in texts {
            for word in text.split_whitespace() {
                if word.contains("://") {
                    continue;
                }
                for token in PATH_TOKEN.find_iter(word) {
                    if let Some(path) = normalize_token(token.as_str()) {
                        files.insert(path);
                    }
                }
            }
        }
        files
    }
}

fn normalize_token(raw: &str) -> Option<String> {
    let token = raw
        .trim_matches(|c: char| matches!(c, '.' | ',' | ':' | ';' | '-'))
        .trim_start_matches("./");
    if token.is_empty() || token.starts_with('/') && token.len() == 1 {
        return None;
    }

    let has_segment = token.contains('/') && token.split('/').any(|part| !part.is_empty());
    let has_extension = token
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext));

    if has_extension || has_segment {
        Some(token.trim_end_matches('/').to_string())
    } else {
        None
    }
}

/// Two tasks of the same wave predicted to touch overlapping files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileConflict {
    pub first: String,
    pub second: String,
    pub files: BTreeSet<String>,
}

/// Predicted files per task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFileMap {
    files: BTreeMap<String, BTreeSet<String>>,
}

impl TaskFileMap {
    pub fn analyze(tasks: &[Task], estimator: &dyn TouchEstimator) -> Self {
        let files = tasks
            .iter()
            .map(|task| (task.id.clone(), estimator.estimate_touched_files(task)))
            .collect();
        Self { files }
    }

    pub fn files_for(&self, task_id: &str) -> Option<&BTreeSet<String>> {
        self.files.get(task_id)
    }

    /// Every pair in `wave` whose predicted files intersect, in wave order.
    pub fn find_conflicts(&self, wave: &[Task]) -> Vec<FileConflict> {
        let mut conflicts = Vec::new();
        for (idx, first) in wave.iter().enumerate() {
            let Some(first_files) = self.files.get(&first.id) else {
                continue;
            };
            for second in &wave[idx + 1..] {
                let Some(second_files) = self.files.get(&second.id) else {
                    continue;
                };
                let files: BTreeSet<String> =
                    first_files.intersection(second_files).cloned().collect();
                if !files.is_empty() {
                    conflicts.push(FileConflict {
                        first: first.id.clone(),
                        second: second.id.clone(),
                        files,
                    });
                }
            }
        }
        conflicts
    }

    /// Partition `wave` into sub-waves with no intra-sub-wave conflicts.
    ///
    /// Greedy colouring in wave order: each task goes to the first sub-wave
    /// with room (at most `max_workers` tasks) and no conflicting member.
    /// Every input task appears in exactly one sub-wave.
    pub fn split_wave_by_conflicts(&self, wave: &[Task], max_workers: usize) -> Vec<Vec<Task>> {
        let capacity = max_workers.max(1);
        let mut neighbours: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let conflicts = self.find_conflicts(wave);
        for conflict in &conflicts {
            neighbours
                .entry(conflict.first.as_str())
                .or_default()
                .insert(conflict.second.as_str());
            neighbours
                .entry(conflict.second.as_str())
                .or_default()
                .insert(conflict.first.as_str());
        }

        let mut sub_waves: Vec<Vec<Task>> = Vec::new();
        for task in wave {
            let blocked = neighbours.get(task.id.as_str());
            let slot = sub_waves.iter().position(|sub_wave| {
                sub_wave.len() < capacity
                    && blocked.is_none_or(|ids| {
                        !sub_wave.iter().any(|member| ids.contains(member.id.as_str()))
                    })
            });
            match slot {
                Some(idx) => sub_waves[idx].push(task.clone()),
                None => sub_waves.push(vec![task.clone()]),
            }
        }
        sub_waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, description: &str) -> Task {
        let mut task = Task::new(id, id);
        task.description = description.to_string();
        task
    }

    fn ids(sub_wave: &[Task]) -> Vec<&str> {
        sub_wave.iter().map(|task| task.id.as_str()).collect()
    }

    #[test]
    fn estimator_picks_paths_and_extensions() {
        let mut task = task("T1", "Update src/main.py, then fix tests/test_cli.py.");
        task.acceptance_criteria = vec!["README.md mentions the flag".to_string()];
        let files = PathTokenEstimator.estimate_touched_files(&task);
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        assert_eq!(files, vec!["README.md", "src/main.py", "tests/test_cli.py"]);
    }

    #[test]
    fn estimator_ignores_plain_words_and_urls() {
        let task = task(
            "T1",
            "Make it faster. See https://example.com/docs/page for context / details",
        );
        assert!(PathTokenEstimator.estimate_touched_files(&task).is_empty());
    }

    #[test]
    fn estimator_keeps_directory_tokens() {
        let task = task("T1", "Refactor everything under src/commands/ now");
        let files = PathTokenEstimator.estimate_touched_files(&task);
        assert!(files.contains("src/commands"));
    }

    #[test]
    fn shared_file_splits_into_separate_sub_waves() {
        let wave = vec![
            task("T1", "Edit src/main.py"),
            task("T2", "Also edit src/main.py"),
            task("T3", "Touch src/other.py"),
        ];
        let map = TaskFileMap::analyze(&wave, &PathTokenEstimator);

        let conflicts = map.find_conflicts(&wave);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].first, "T1");
        assert_eq!(conflicts[0].second, "T2");

        let sub_waves = map.split_wave_by_conflicts(&wave, 3);
        assert_eq!(sub_waves.len(), 2);
        assert_eq!(ids(&sub_waves[0]), vec!["T1", "T3"]);
        assert_eq!(ids(&sub_waves[1]), vec!["T2"]);
    }

    #[test]
    fn split_respects_max_workers_without_dropping_tasks() {
        let wave: Vec<Task> = (0..7)
            .map(|idx| task(&format!("T{idx}"), &format!("Create src/mod{idx}.rs")))
            .collect();
        let map = TaskFileMap::analyze(&wave, &PathTokenEstimator);
        let sub_waves = map.split_wave_by_conflicts(&wave, 3);
        assert_eq!(
            sub_waves.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(sub_waves.iter().map(Vec::len).sum::<usize>(), wave.len());
    }

    #[test]
    fn no_sub_wave_contains_a_conflicting_pair() {
        let wave = vec![
            task("A", "src/a.rs src/shared.rs"),
            task("B", "src/b.rs src/shared.rs"),
            task("C", "src/b.rs"),
            task("D", "src/d.rs"),
            task("E", "src/a.rs"),
        ];
        let map = TaskFileMap::analyze(&wave, &PathTokenEstimator);
        for sub_wave in map.split_wave_by_conflicts(&wave, 4) {
            assert!(map.find_conflicts(&sub_wave).is_empty());
        }
    }

    #[test]
    fn single_task_wave_is_unchanged() {
        let wave = vec![task("solo", "src/lib.rs")];
        let map = TaskFileMap::analyze(&wave, &PathTokenEstimator);
        let sub_waves = map.split_wave_by_conflicts(&wave, 3);
        assert_eq!(sub_waves.len(), 1);
        assert_eq!(ids(&sub_waves[0]), vec!["solo"]);
    }
}
