use super::errors::JobError;

pub type JobResult<E> = Result<(), JobError<E>>;
