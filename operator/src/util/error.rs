#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}
