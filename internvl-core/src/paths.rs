use std::path::{Path, PathBuf};

use hf_hub::{
    api::sync::{ApiBuilder, ApiError as HFHubApiError, ApiRepo},
    Repo, RepoType,
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum HFError {
    #[error("Unable to load {path} file from {model_id} repo.")]
    FileNotFound { model_id: String, path: String },

    #[error("HF API error occurred: {0:?}")]
    HFHubApiError(#[from] HFHubApiError),

    #[error("IoError: {0:?}")]
    IoError(#[from] std::io::Error),

    #[error("HF repo has invalid structure: {0:?}")]
    InvalidRepoStructure(String),
}

/// Attempts to retrieve a file from a HF repo. Will check if the file exists locally first.
pub fn api_get_file(
    api: &ApiRepo,
    file: &str,
    model_id: impl AsRef<Path>,
) -> Result<PathBuf, HFError> {
    let model_id = model_id.as_ref();

    if model_id.exists() {
        let path = model_id.join(file);
        if !path.exists() {
            return Err(HFError::FileNotFound {
                model_id: model_id.display().to_string(),
                path: file.to_string(),
            });
        }
        info!("Loading `{file}` locally at `{}`", path.display());
        Ok(path)
    } else {
        Ok(api.get(file)?)
    }
}

/// List contents of a directory, either from local filesystem or API
pub fn api_dir_list(api: &ApiRepo, model_id: impl AsRef<Path>) -> Result<Vec<String>, HFError> {
    let model_id = model_id.as_ref();

    if model_id.exists() {
        std::fs::read_dir(model_id)?
            .map(|entry| {
                let entry = entry?;
                entry
                    .file_name()
                    .to_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| HFError::FileNotFound {
                        model_id: model_id.display().to_string(),
                        path: entry.path().display().to_string(),
                    })
            })
            .collect()
    } else {
        let repo = api.info()?;
        Ok(repo.siblings.iter().map(|x| x.rfilename.clone()).collect())
    }
}

/// A checkpoint location: a local directory, or a Hub model id resolved through the
/// `hf-hub` cache.
pub struct ModelRepo {
    model_id: String,
    api: ApiRepo,
    contents: Vec<String>,
}

impl ModelRepo {
    pub fn new(model_id: &str) -> Result<Self, HFError> {
        let api = ApiBuilder::new().with_progress(true).build()?;
        let api = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            "main".to_string(),
        ));
        let contents = api_dir_list(&api, model_id)?;
        Ok(Self {
            model_id: model_id.to_string(),
            api,
            contents,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn contains(&self, file: &str) -> bool {
        self.contents.iter().any(|f| f == file)
    }

    pub fn get(&self, file: &str) -> Result<PathBuf, HFError> {
        api_get_file(&self.api, file, &self.model_id)
    }

    /// All `*.safetensors` shards, in name order.
    pub fn safetensors(&self) -> Result<Vec<PathBuf>, HFError> {
        let mut shards = self
            .contents
            .iter()
            .filter(|f| f.ends_with(".safetensors"))
            .collect::<Vec<_>>();
        if shards.is_empty() {
            return Err(HFError::InvalidRepoStructure(format!(
                "no `.safetensors` files in {}",
                self.model_id
            )));
        }
        shards.sort();
        shards.into_iter().map(|f| self.get(f)).collect()
    }
}
