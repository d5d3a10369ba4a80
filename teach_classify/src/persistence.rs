//! Saving trained heads under opaque handles.
//!
//! A handle maps to two files in the store directory: `<handle>.head` holds the bincode encoded
//! [`HeadParams`], `<handle>.meta.json` the project name and ordered class labels.
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use common::ProjectMeta;

use crate::{
    head::{ClassifierHead, HeadParams},
    trainer::TrainedModel,
    Error, Result,
};

/// Abstract save/load/delete of trained heads.
pub trait ModelStore: Send + Sync {
    fn save(&self, handle: &str, project: &str, model: &TrainedModel) -> Result<()>;

    /// Restore a model together with the project name it was saved under.
    fn load(&self, handle: &str) -> Result<(String, TrainedModel)>;

    fn delete(&self, handle: &str) -> Result<()>;
}

pub struct FileModelStore {
    dir: PathBuf,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, handle: &str) -> Result<(PathBuf, PathBuf)> {
        check_handle(handle)?;
        Ok((
            self.dir.join(format!("{handle}.head")),
            self.dir.join(format!("{handle}.meta.json")),
        ))
    }
}

impl ModelStore for FileModelStore {
    fn save(&self, handle: &str, project: &str, model: &TrainedModel) -> Result<()> {
        let (head_path, meta_path) = self.paths(handle)?;
        let meta = ProjectMeta {
            project: project.to_owned(),
            classes: model.labels().to_vec(),
        };

        let head_bytes =
            bincode::serialize(model.head().params()).map_err(|e| Error::persistence(handle, e))?;
        let meta_json =
            serde_json::to_string_pretty(&meta).map_err(|e| Error::persistence(handle, e))?;

        fs::create_dir_all(&self.dir).map_err(|e| Error::persistence(handle, e))?;
        write_all_or_nothing(&[(head_path, head_bytes), (meta_path, meta_json.into_bytes())])
            .map_err(|e| Error::persistence(handle, e))?;

        log::info!("Saved classifier '{handle}' to {}", self.dir.display());
        Ok(())
    }

    fn load(&self, handle: &str) -> Result<(String, TrainedModel)> {
        let (head_path, meta_path) = self.paths(handle)?;

        let head_bytes = fs::read(&head_path).map_err(|e| Error::persistence(handle, e))?;
        let params: HeadParams =
            bincode::deserialize(&head_bytes).map_err(|e| Error::persistence(handle, e))?;
        let meta_json = fs::read_to_string(&meta_path).map_err(|e| Error::persistence(handle, e))?;
        let meta: ProjectMeta =
            serde_json::from_str(&meta_json).map_err(|e| Error::persistence(handle, e))?;

        let head = ClassifierHead::from_params(params)?;
        let model = TrainedModel::new(meta.classes, head)?;

        log::info!(
            "Loaded classifier '{handle}' with classes {:?}",
            model.labels()
        );
        Ok((meta.project, model))
    }

    fn delete(&self, handle: &str) -> Result<()> {
        let (head_path, meta_path) = self.paths(handle)?;

        let mut removed = false;
        for path in [head_path, meta_path] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::persistence(handle, e)),
            }
        }

        match removed {
            true => Ok(()),
            false => Err(Error::persistence(handle, "no saved classifier")),
        }
    }
}

/// Write every file under a staging name, then move them into place. On failure no file of
/// this write is left behind.
fn write_all_or_nothing(files: &[(PathBuf, Vec<u8>)]) -> io::Result<()> {
    let staged: Vec<PathBuf> = files.iter().map(|(path, _)| staging_path(path)).collect();
    let mut placed = 0;

    let result = files
        .iter()
        .zip(&staged)
        .try_for_each(|((_, bytes), tmp)| fs::write(tmp, bytes))
        .and_then(|()| {
            files.iter().zip(&staged).try_for_each(|((path, _), tmp)| {
                fs::rename(tmp, path)?;
                placed += 1;
                Ok(())
            })
        });

    if result.is_err() {
        for path in staged.iter().chain(files[..placed].iter().map(|(path, _)| path)) {
            fs::remove_file(path).ok();
        }
    }
    result
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn check_handle(handle: &str) -> Result<()> {
    let valid = !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    match valid {
        true => Ok(()),
        false => Err(Error::persistence(
            handle,
            "handles may only contain letters, digits, '_' and '-'",
        )),
    }
}
