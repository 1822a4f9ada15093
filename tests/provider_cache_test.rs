//! Two-layer provider cache: freshness rules, TTL asymmetry, eviction.

use leadscrape::{open_memory_pool, ProviderCache};

async fn backdate(pool: &sqlx::SqlitePool, phone: &str, secs: i64) {
    sqlx::query("UPDATE provider_cache SET written_at = written_at - ? WHERE phone = ?")
        .bind(secs)
        .bind(phone)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn fresh_entries_hit() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool);

    cache.put("0111111111", "TELKOM").await.unwrap();
    assert_eq!(
        cache.get("0111111111").await.unwrap(),
        Some("TELKOM".to_string())
    );
    assert_eq!(cache.get("0119999999").await.unwrap(), None);
}

#[tokio::test]
async fn l2_hit_repopulates_l1() {
    let pool = open_memory_pool().await.unwrap();
    let writer = ProviderCache::new(pool.clone());
    writer.put("0112222222", "VODACOM").await.unwrap();

    // A second cache instance has a cold L1 but shares L2
    let reader = ProviderCache::new(pool);
    assert_eq!(reader.l1_len().await, 0);
    assert_eq!(
        reader.get("0112222222").await.unwrap(),
        Some("VODACOM".to_string())
    );
    assert_eq!(reader.l1_len().await, 1);
}

#[tokio::test]
async fn unknown_entries_expire_after_a_day() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool.clone());

    cache.put("0113333333", "Unknown").await.unwrap();
    assert_eq!(
        cache.get("0113333333").await.unwrap(),
        Some("Unknown".to_string())
    );

    // Push it past the 1-day Unknown TTL; a resolved entry this old would
    // still be fresh
    backdate(&pool, "0113333333", 2 * 24 * 3600).await;
    let cold = ProviderCache::new(pool);
    assert_eq!(cold.get("0113333333").await.unwrap(), None);
}

#[tokio::test]
async fn resolved_entries_survive_where_unknown_does_not() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool.clone());

    cache.put("0114444444", "MTN").await.unwrap();
    backdate(&pool, "0114444444", 2 * 24 * 3600).await;

    let cold = ProviderCache::new(pool);
    assert_eq!(cold.get("0114444444").await.unwrap(), Some("MTN".to_string()));
}

#[tokio::test]
async fn resolved_entries_expire_after_the_configured_ttl() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool.clone());

    cache.put("0115555555", "TELKOM").await.unwrap();
    backdate(&pool, "0115555555", 31 * 24 * 3600).await;

    let cold = ProviderCache::new(pool);
    assert_eq!(cold.get("0115555555").await.unwrap(), None);
}

#[tokio::test]
async fn rewrite_refreshes_the_entry() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool.clone());

    cache.put("0116666666", "Unknown").await.unwrap();
    backdate(&pool, "0116666666", 2 * 24 * 3600).await;
    cache.put("0116666666", "CELLC").await.unwrap();

    assert_eq!(
        cache.get("0116666666").await.unwrap(),
        Some("CELLC".to_string())
    );
}

#[tokio::test]
async fn eviction_drops_stale_rows() {
    let pool = open_memory_pool().await.unwrap();
    let cache = ProviderCache::new(pool.clone());

    cache.put("0117777777", "Unknown").await.unwrap();
    cache.put("0118888888", "MTN").await.unwrap();
    backdate(&pool, "0117777777", 2 * 24 * 3600).await;

    let evicted = cache.evict_stale().await.unwrap();
    assert_eq!(evicted, 1);

    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, 1);
}
