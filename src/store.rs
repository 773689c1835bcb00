use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use git2::{Commit, Delta, ObjectType, Oid, Repository, Signature, Sort};

use crate::config::MemoryConfig;
use crate::error::{
    MemoryError, Result, invalid_ref_error, lock_timeout_error, no_commits_error,
    path_traversal_error,
};
use crate::model::{CommitInfo, FileSnapshot};

/// Characters that are never allowed in a user supplied ref name. Covers
/// shell metacharacters alongside what git itself rejects.
const REF_FORBIDDEN_CHARS: &[char] = &[
    ' ', '\t', '\n', '\r', ':', ';', '|', '&', '$', '`', '(', ')', '<', '>', '*', '?', '[', ']',
    '!', '#', '~', '^', '\\', '\'', '"',
];

/// Validate a namespaced ref name before it reaches git. Rejects traversal,
/// embedded colons, shell metacharacters, and malformed components.
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains("..")
        || name.starts_with('/')
        || name.ends_with('/')
        || name.contains("//")
        || name.ends_with(".lock")
        || name.contains(REF_FORBIDDEN_CHARS)
    {
        return Err(invalid_ref_error(name));
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with('.') {
            return Err(invalid_ref_error(name));
        }
    }
    Ok(())
}

/// Validate a repository-relative path from user input.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(path_traversal_error(path));
    }
    Ok(())
}

/// A held advisory file lock. Released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    /// Block up to `timeout` acquiring an exclusive lock on `path`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = Self::open_lock_file(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => {
                    tracing::debug!("waiting for lock at {:?}", path);
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return Err(lock_timeout_error(timeout.as_secs())),
            }
        }
    }

    /// Try to take the lock without waiting. `None` means another process
    /// holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = Self::open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// A change to one annotated commit's note observed between two states of
/// the notes ref.
#[derive(Debug, Clone)]
pub enum NoteChange {
    /// The note for this commit was created or rewritten.
    Upserted { commit_sha: String, blob: String },
    /// The note for this commit was removed.
    Removed { commit_sha: String },
}

/// Adapter over the commit-graph backing store: commit-attached notes on a
/// namespaced ref, plus the commit metadata hydration needs.
pub struct NotesStore {
    repo: Repository,
    notes_ref: String,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl NotesStore {
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        validate_ref_name(&config.notes_ref)?;
        let repo = Repository::discover(&config.repo_path)?;
        let lock_path = repo.path().join(format!(
            "{}.lock",
            config.notes_ref.replace('/', "-")
        ));
        Ok(Self {
            repo,
            notes_ref: config.notes_ref.clone(),
            lock_path,
            lock_timeout: Duration::from_secs(config.lock_timeout_seconds),
        })
    }

    pub fn notes_ref(&self) -> &str {
        &self.notes_ref
    }

    /// Take the cross-process write lock for the notes ref, waiting up to
    /// the configured timeout.
    pub fn lock_for_write(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path, self.lock_timeout)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("mnemo", "mnemo@localhost")?),
        }
    }

    fn parse_oid(&self, sha: &str) -> Result<Oid> {
        Oid::from_str(sha).map_err(|e| MemoryError::storage(format!("bad commit sha {sha:?}: {e}")))
    }

    /// Resolve `HEAD` to a commit sha. Surfaces the no-commits error on an
    /// unborn branch.
    pub fn head_commit(&self) -> Result<String> {
        let head = self.repo.head().map_err(|_| no_commits_error())?;
        let commit = head.peel_to_commit().map_err(|_| no_commits_error())?;
        Ok(commit.id().to_string())
    }

    /// Resolve a target commit: `None` or `"HEAD"` means the current head.
    pub fn resolve_commit(&self, target: Option<&str>) -> Result<String> {
        match target {
            None => self.head_commit(),
            Some(t) if t.eq_ignore_ascii_case("head") => self.head_commit(),
            Some(sha) => {
                let oid = self.parse_oid(sha)?;
                self.repo.find_commit(oid)?;
                Ok(sha.to_string())
            }
        }
    }

    pub fn commit_info(&self, sha: &str) -> Result<CommitInfo> {
        let oid = self.parse_oid(sha)?;
        let commit = self.repo.find_commit(oid)?;
        Ok(Self::info_from_commit(&commit))
    }

    fn info_from_commit(commit: &Commit) -> CommitInfo {
        let author = commit.author();
        CommitInfo {
            sha: commit.id().to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            message: commit.summary().unwrap_or("").to_string(),
            committed_at: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0),
        }
    }

    /// Read the note blob attached to a commit, if any.
    pub fn read_note(&self, commit_sha: &str) -> Result<Option<String>> {
        let oid = self.parse_oid(commit_sha)?;
        match self.repo.find_note(Some(&self.notes_ref), oid) {
            Ok(note) => Ok(note.message().map(|m| m.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (force-replace) the note blob for a commit. Callers hold the
    /// write lock.
    pub fn write_note(&self, commit_sha: &str, text: &str) -> Result<()> {
        let oid = self.parse_oid(commit_sha)?;
        let sig = self.signature()?;
        self.repo
            .note(&sig, &sig, Some(&self.notes_ref), oid, text, true)?;
        Ok(())
    }

    /// Remove the note attached to a commit, if any.
    pub fn remove_note(&self, commit_sha: &str) -> Result<()> {
        let oid = self.parse_oid(commit_sha)?;
        let sig = self.signature()?;
        match self.repo.note_delete(oid, Some(&self.notes_ref), &sig, &sig) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Iterate every (annotated commit sha, note text) pair on the ref.
    pub fn iter_notes(&self) -> Result<Vec<(String, String)>> {
        let iter = match self.repo.notes(Some(&self.notes_ref)) {
            Ok(iter) => iter,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut notes = Vec::new();
        for entry in iter {
            let (note_oid, annotated_oid) = entry?;
            let blob = self.repo.find_blob(note_oid)?;
            if let Ok(text) = std::str::from_utf8(blob.content()) {
                notes.push((annotated_oid.to_string(), text.to_string()));
            }
        }
        Ok(notes)
    }

    /// The tip commit of the notes ref, if the ref exists.
    pub fn notes_tip(&self) -> Result<Option<String>> {
        match self.repo.find_reference(&self.notes_ref) {
            Ok(reference) => {
                let commit = reference.peel_to_commit()?;
                Ok(Some(commit.id().to_string()))
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Commits on the notes ref newer than `since`, oldest first. A `since`
    /// that no longer resolves (rewritten ref) falls back to the full walk.
    pub fn notes_commits_since(&self, since: Option<&str>) -> Result<Vec<String>> {
        let Some(tip) = self.notes_tip()? else {
            return Ok(Vec::new());
        };
        if since == Some(tip.as_str()) {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk()?;
        walk.push(self.parse_oid(&tip)?)?;
        if let Some(checkpoint) = since {
            if let Ok(oid) = Oid::from_str(checkpoint) {
                if walk.hide(oid).is_err() {
                    tracing::warn!("sync checkpoint {checkpoint} is unreachable, walking full history");
                }
            }
        }
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        let mut commits = Vec::new();
        for oid in walk {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    /// Note entries changed by one commit on the notes ref, diffed against
    /// its first parent. Note tree paths name the annotated commit sha,
    /// possibly fanned out into subdirectories.
    pub fn changed_notes(&self, notes_commit_sha: &str) -> Result<Vec<NoteChange>> {
        let oid = self.parse_oid(notes_commit_sha)?;
        let commit = self.repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        let diff =
            self.repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added | Delta::Modified => {
                    let path = delta.new_file().path().and_then(|p| p.to_str());
                    let Some(path) = path else { continue };
                    let commit_sha = path.replace('/', "");
                    let blob = self.repo.find_blob(delta.new_file().id())?;
                    if let Ok(text) = std::str::from_utf8(blob.content()) {
                        changes.push(NoteChange::Upserted {
                            commit_sha,
                            blob: text.to_string(),
                        });
                    }
                }
                Delta::Deleted => {
                    let path = delta.old_file().path().and_then(|p| p.to_str());
                    let Some(path) = path else { continue };
                    changes.push(NoteChange::Removed {
                        commit_sha: path.replace('/', ""),
                    });
                }
                _ => {}
            }
        }
        Ok(changes)
    }

    /// Paths changed by a commit against its first parent.
    pub fn changed_paths(&self, commit_sha: &str) -> Result<Vec<String>> {
        let oid = self.parse_oid(commit_sha)?;
        let commit = self.repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        let diff =
            self.repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        Ok(diff
            .deltas()
            .filter_map(|d| {
                d.new_file()
                    .path()
                    .or_else(|| d.old_file().path())
                    .and_then(|p| p.to_str())
                    .map(String::from)
            })
            .collect())
    }

    /// Read a file's content as it was at a commit. Binary or missing files
    /// return `None`.
    pub fn file_at_commit(&self, commit_sha: &str, path: &str) -> Result<Option<String>> {
        validate_relative_path(path)?;
        let oid = self.parse_oid(commit_sha)?;
        let commit = self.repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(None);
        }
        let blob = self.repo.find_blob(entry.id())?;
        Ok(std::str::from_utf8(blob.content()).ok().map(String::from))
    }

    /// Snapshots of the files a commit changed, skipping binaries.
    pub fn changed_files(&self, commit_sha: &str) -> Result<Vec<FileSnapshot>> {
        let mut snapshots = Vec::new();
        for path in self.changed_paths(commit_sha)? {
            if let Some(content) = self.file_at_commit(commit_sha, &path)? {
                snapshots.push(FileSnapshot { path, content });
            }
        }
        Ok(snapshots)
    }
}
