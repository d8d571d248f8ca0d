//! Project storage.
//!
//! A project is one cassette: four tracks plus its counter position and
//! label. [`DirectoryStore`] keeps each project in its own directory named
//! by the project id, with metadata in `project.json` and each track's
//! audio in `track-N.wav` (the canonical PCM container).

use super::track::{TrackDescriptor, TrackId};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Cassette shell colours assigned to new projects.
pub const CASSETTE_COLORS: [&str; 10] = [
    "#ff6b35", "#4ade80", "#60a5fa", "#f472b6", "#a78bfa", "#fbbf24", "#ef4444", "#14b8a6",
    "#fb923c", "#c084fc",
];

const METADATA_FILE: &str = "project.json";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored cassette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectData {
    /// Track descriptors; audio bytes live next to the metadata file.
    pub tracks: Vec<TrackDescriptor>,

    /// Playhead position when the project was saved.
    #[serde(default)]
    pub counter_position: f64,

    #[serde(default)]
    pub title: String,

    /// Hex colour of the cassette shell.
    #[serde(default)]
    pub color: String,

    pub created_at: u64,
    pub updated_at: u64,
}

impl ProjectData {
    /// A blank cassette with a colour picked from `seed`.
    pub fn empty(seed: u8) -> Self {
        let now = now_millis();
        Self {
            tracks: TrackDescriptor::blank_tape(),
            counter_position: 0.0,
            title: String::new(),
            color: CASSETTE_COLORS[seed as usize % CASSETTE_COLORS.len()].to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Descriptor for a slot, if present.
    pub fn track(&self, id: TrackId) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.id == id)
    }
}

/// Key-value storage of projects by id.
pub trait ProjectStore {
    /// Loads a project, or `None` if no project has this id.
    fn load(&self, id: &str) -> Result<Option<ProjectData>>;

    /// Stores a project, replacing any previous version.
    fn save(&self, id: &str, project: &ProjectData) -> Result<()>;

    /// Removes a project. Removing a missing project is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// All stored projects.
    fn list(&self) -> Result<Vec<(String, ProjectData)>>;
}

/// Filesystem-backed project store.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// # Arguments
    ///
    /// * `root` - Directory holding one subdirectory per project
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates and saves a blank project, returning its id.
    pub fn create(&self) -> Result<(String, ProjectData)> {
        let uuid = Uuid::new_v4();
        let project = ProjectData::empty(uuid.as_bytes()[15]);
        let id = uuid.to_string();
        self.save(&id, &project)?;
        tracing::info!("Created project {} ({})", id, project.color);
        Ok((id, project))
    }

    fn project_dir(&self, id: &str) -> Result<PathBuf> {
        if Uuid::parse_str(id).is_err() {
            bail!("Invalid project id: {}", id);
        }
        Ok(self.root.join(id))
    }

    fn track_path(dir: &Path, id: TrackId) -> PathBuf {
        dir.join(format!("track-{}.wav", id.number()))
    }
}

impl ProjectStore for DirectoryStore {
    fn load(&self, id: &str) -> Result<Option<ProjectData>> {
        let dir = self.project_dir(id)?;
        let metadata = dir.join(METADATA_FILE);
        if !metadata.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&metadata)
            .with_context(|| format!("Failed to read project: {}", metadata.display()))?;
        let mut project: ProjectData = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse project: {}", metadata.display()))?;

        for track in &mut project.tracks {
            let path = Self::track_path(&dir, track.id);
            if path.exists() {
                let bytes = fs::read(&path)
                    .with_context(|| format!("Failed to read track audio: {}", path.display()))?;
                track.audio = Some(bytes);
            }
        }

        Ok(Some(project))
    }

    fn save(&self, id: &str, project: &ProjectData) -> Result<()> {
        let dir = self.project_dir(id)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create project directory: {}", dir.display()))?;

        for track in TrackId::ALL {
            let path = Self::track_path(&dir, track);
            match project.track(track).and_then(|t| t.audio.as_ref()) {
                Some(bytes) => fs::write(&path, bytes)
                    .with_context(|| format!("Failed to write track audio: {}", path.display()))?,
                None if path.exists() => fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove track audio: {}", path.display()))?,
                None => {}
            }
        }

        let mut stored = project.clone();
        stored.updated_at = now_millis();
        let json = serde_json::to_string_pretty(&stored).context("Failed to serialize project")?;
        let metadata = dir.join(METADATA_FILE);
        fs::write(&metadata, json)
            .with_context(|| format!("Failed to write project: {}", metadata.display()))?;

        tracing::debug!("Saved project {}", id);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let dir = self.project_dir(id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to delete project: {}", dir.display()))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, ProjectData)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list projects: {}", self.root.display()))?
        {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if Uuid::parse_str(&id).is_err() {
                continue;
            }
            match self.load(&id) {
                Ok(Some(project)) => projects.push((id, project)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable project {}: {:#}", id, e),
            }
        }
        projects.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        Ok(projects)
    }
}
