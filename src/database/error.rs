use thiserror::Error;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    /// 唯一约束冲突或状态已不满足条件
    #[error("conflict: {0}")]
    Conflict(String),

    /// 数据库中的值无法解析为领域类型
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// PostgreSQL 唯一约束冲突转换为 Conflict
    pub fn from_unique_violation(e: sqlx::Error, what: &str) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("{what} already exists"))
            }
            _ => StoreError::Database(e),
        }
    }
}
