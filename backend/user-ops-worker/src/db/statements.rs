//! Multi-row statements for the `users` table
//!
//! Each builder is created per chunk, so bind placeholders always start at
//! `$1`. With four columns per row a chunk may hold at most
//! [`MAX_ROWS_PER_STATEMENT`] rows before hitting the Postgres bind limit.

use sqlx::{Postgres, QueryBuilder};

use crate::models::{NewUser, UserPatch};

/// Postgres accepts at most 65535 bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Largest chunk the update statement (4 binds per row) can carry
pub const MAX_ROWS_PER_STATEMENT: usize = MAX_BIND_PARAMS / 4;

/// `INSERT INTO users (name, email, age) VALUES (...), ... RETURNING id`
pub fn insert_users(chunk: &[NewUser]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new("INSERT INTO users (name, email, age) ");
    qb.push_values(chunk, |mut row, user| {
        row.push_bind(user.name.as_str())
            .push_bind(user.email.as_str())
            .push_bind(user.age);
    });
    qb.push(" RETURNING id");
    qb
}

/// Merge update joined against an inline value set.
///
/// Every column is `COALESCE(supplied, existing)`; the casts give all-NULL
/// columns a type. Ids with no matching row are skipped by the join.
pub fn update_users(chunk: &[UserPatch]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "UPDATE users AS u SET \
         name = COALESCE(v.name, u.name), \
         email = COALESCE(v.email, u.email), \
         age = COALESCE(v.age, u.age) \
         FROM (",
    );
    qb.push_values(chunk, |mut row, patch| {
        row.push_bind(patch.id)
            .push_unseparated("::INTEGER")
            .push_bind(patch.name.as_deref())
            .push_unseparated("::TEXT")
            .push_bind(patch.email.as_deref())
            .push_unseparated("::TEXT")
            .push_bind(patch.age)
            .push_unseparated("::INTEGER");
    });
    qb.push(") AS v(id, name, email, age) WHERE u.id = v.id RETURNING u.id");
    qb
}
