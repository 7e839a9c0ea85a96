use snafu::{Location, Snafu};
use tansu_types::{MetadataRevision, TlfId};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("no metadata cached for {tlf} revision {revision} (merged: {merged})"))]
    NoSuchMetadata {
        tlf: TlfId,
        revision: MetadataRevision,
        merged: bool,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("folder {tlf} has no metadata history"))]
    UnknownFolder {
        tlf: TlfId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "revision {revision} conflicts with the folder head {head}",
    ))]
    RevisionConflict {
        revision: MetadataRevision,
        head: MetadataRevision,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("metadata revision {revision} is not initialised"))]
    InvalidRevision {
        revision: MetadataRevision,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
