use ci_insights_jobs::tasks::TaskType;
use typed_path::Utf8NativePathBuf;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

// For argp::FromArgs
pub fn task_type(value: &str) -> Result<TaskType, String> {
    value.parse().map_err(|_| {
        let known = TaskType::ALL.map(|t| t.as_str()).join(", ");
        format!("unknown task type '{value}' (expected one of: {known})")
    })
}
