//! Repository for the `dreams` and `dream_images` tables.
//!
//! Dreams are only ever written whole: the dream row and all of its image
//! rows commit in one transaction or not at all.

use crate::models::dream::{DreamImageRow, DreamRow, NewDream, NewDreamImage};
use crate::DbPool;

/// Column list for `dreams` queries.
const COLUMNS: &str = "\
    id, prompt, seed, num_images, settings_json, \
    base_image_path, base_image_mask_path, created_at";

/// Column list for `dream_images` queries.
const IMAGE_COLUMNS: &str = "\
    id, dream_id, seed, image_index, image_path, width, height, perceptual_hash";

pub struct DreamRepo;

impl DreamRepo {
    /// Insert a finished dream and its images atomically.
    pub async fn insert_finished(
        pool: &DbPool,
        dream: &NewDream,
        images: &[NewDreamImage],
    ) -> Result<DreamRow, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO dreams ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, DreamRow>(&query)
            .bind(&dream.id)
            .bind(&dream.prompt)
            .bind(i64::from(dream.seed))
            .bind(i64::from(dream.num_images))
            .bind(&dream.settings_json)
            .bind(&dream.base_image_path)
            .bind(&dream.base_image_mask_path)
            .bind(dream.created_at)
            .fetch_one(&mut *tx)
            .await?;

        let image_query = format!(
            "INSERT INTO dream_images ({IMAGE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for image in images {
            sqlx::query(&image_query)
                .bind(&image.id)
                .bind(&dream.id)
                .bind(i64::from(image.seed))
                .bind(i64::from(image.image_index))
                .bind(&image.image_path)
                .bind(i64::from(image.width))
                .bind(i64::from(image.height))
                .bind(&image.perceptual_hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    pub async fn find_by_id(pool: &DbPool, id: &str) -> Result<Option<DreamRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dreams WHERE id = ?");
        sqlx::query_as::<_, DreamRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Images of a dream, in index order.
    pub async fn list_images(
        pool: &DbPool,
        dream_id: &str,
    ) -> Result<Vec<DreamImageRow>, sqlx::Error> {
        let query = format!(
            "SELECT {IMAGE_COLUMNS} FROM dream_images \
             WHERE dream_id = ? ORDER BY image_index"
        );
        sqlx::query_as::<_, DreamImageRow>(&query)
            .bind(dream_id)
            .fetch_all(pool)
            .await
    }

    pub async fn count(pool: &DbPool) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dreams")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_memory_pool;

    fn new_dream(id: &str) -> NewDream {
        NewDream {
            id: id.to_string(),
            prompt: "a lighthouse".to_string(),
            seed: 42,
            num_images: 2,
            settings_json: "{}".to_string(),
            base_image_path: None,
            base_image_mask_path: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn new_image(id: &str, index: u32) -> NewDreamImage {
        NewDreamImage {
            id: id.to_string(),
            seed: 42 + index,
            image_index: index,
            image_path: format!("d1/{id}.png"),
            width: 512,
            height: 512,
            perceptual_hash: "00ff00ff00ff00ff".to_string(),
        }
    }

    #[tokio::test]
    async fn inserts_dream_with_images() {
        let pool = create_memory_pool().await.unwrap();

        let row = DreamRepo::insert_finished(
            &pool,
            &new_dream("d1"),
            &[new_image("i1", 1), new_image("i0", 0)],
        )
        .await
        .unwrap();
        assert_eq!(row.seed, 42);

        let found = DreamRepo::find_by_id(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(found.num_images, 2);

        let images = DreamRepo::list_images(&pool, "d1").await.unwrap();
        let ids: Vec<_> = images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i0", "i1"]);
    }

    #[tokio::test]
    async fn failed_image_insert_rolls_back_dream() {
        let pool = create_memory_pool().await.unwrap();

        // Duplicate image index violates the unique constraint.
        let result = DreamRepo::insert_finished(
            &pool,
            &new_dream("d1"),
            &[new_image("i0", 0), new_image("i1", 0)],
        )
        .await;

        assert!(result.is_err());
        assert_eq!(DreamRepo::count(&pool).await.unwrap(), 0);
        assert!(DreamRepo::find_by_id(&pool, "d1").await.unwrap().is_none());
    }
}
