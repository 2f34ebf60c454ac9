use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("cannot load configuration")]
    Config,
    #[display("cannot set up logging: {_0}")]
    Logging(#[error(not(source))] String),
    #[display("cannot connect to the message broker")]
    Connect,
    /// The broker connection failed while consuming
    #[display("message transport failed")]
    Transport,
}
