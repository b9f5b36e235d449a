//! Station selection and aggregation against a real (in-memory) database.

mod common;

use common::{entry, station, test_db};
use weather_gateway::aggregate;

#[tokio::test]
async fn fetch_conditions_returns_latest_entry_per_station() {
    let db = test_db();
    let stations = vec![station("b1", "s1", 45.5, -122.6), station("b1", "s2", 45.6, -122.7)];
    for s in &stations {
        db.update_station_info(s).await.unwrap();
    }

    db.insert_weather_entry(&entry("b1", "s1", "2024-01-01T00:00:00Z", &[("temp", "c", 1.0)]))
        .await
        .unwrap();
    db.insert_weather_entry(&entry("b1", "s1", "2024-01-01T01:00:00Z", &[("temp", "c", 2.0)]))
        .await
        .unwrap();
    db.insert_weather_entry(&entry("b1", "s2", "2024-01-01T00:30:00Z", &[("temp", "c", 8.0)]))
        .await
        .unwrap();

    let conditions = aggregate::fetch_conditions(&db, &stations).await.unwrap();
    assert_eq!(conditions.len(), 2);

    let s1 = conditions.iter().find(|c| c.station == "s1").unwrap();
    assert_eq!(s1.sensors["temp"][0].value, 2.0);
    let s2 = conditions.iter().find(|c| c.station == "s2").unwrap();
    assert_eq!(s2.sensors["temp"][0].value, 8.0);
}

#[tokio::test]
async fn fetch_conditions_distinguishes_same_station_name_across_servers() {
    let db = test_db();
    let stations = vec![station("b1", "s1", 45.5, -122.6), station("b2", "s1", 45.6, -122.7)];
    for s in &stations {
        db.update_station_info(s).await.unwrap();
    }

    db.insert_weather_entry(&entry("b1", "s1", "2024-01-01T00:00:00Z", &[("temp", "c", 1.0)]))
        .await
        .unwrap();
    db.insert_weather_entry(&entry("b2", "s1", "2024-01-01T00:00:00Z", &[("temp", "c", 9.0)]))
        .await
        .unwrap();

    let conditions = aggregate::fetch_conditions(&db, &stations).await.unwrap();
    assert_eq!(conditions.len(), 2);
    let b1 = conditions.iter().find(|c| c.server == "b1").unwrap();
    assert_eq!(b1.sensors["temp"][0].value, 1.0);
}

#[tokio::test]
async fn find_nearest_stations_filters_by_exact_distance() {
    let db = test_db();
    // Roughly 15 km north, 120 km north, and a bounding-box corner about
    // 63 km out. The corner station survives the box but not the exact
    // haversine check.
    db.update_station_info(&station("b1", "near", 0.135, 0.0)).await.unwrap();
    db.update_station_info(&station("b1", "far", 1.08, 0.0)).await.unwrap();
    db.update_station_info(&station("b1", "corner", 0.4, 0.4)).await.unwrap();

    let (stations, distances) = aggregate::find_nearest_stations(&db, 0.0, 0.0, 50.0)
        .await
        .unwrap();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].station, "near");
    assert!((distances[0] - 15.0).abs() < 1.0);
}

#[tokio::test]
async fn find_nearest_stations_empty_when_out_of_range() {
    let db = test_db();
    db.update_station_info(&station("b1", "s1", 10.0, 10.0)).await.unwrap();

    let (stations, _) = aggregate::find_nearest_stations(&db, 0.0, 0.0, 1.0).await.unwrap();
    assert!(stations.is_empty());
}

#[tokio::test]
async fn find_region_stations_matches_hierarchy() {
    let db = test_db();
    db.update_station_info(&station("b1", "s1", 45.5, -122.6)).await.unwrap();
    let mut elsewhere = station("b1", "s2", 47.6, -122.3);
    elsewhere.city = "Seattle".to_string();
    elsewhere.region = "Washington".to_string();
    db.update_station_info(&elsewhere).await.unwrap();

    let stations = aggregate::find_region_stations(&db, "", "Portland", "Oregon", "US")
        .await
        .unwrap();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].station, "s1");

    let stations = aggregate::find_region_stations(&db, "", "", "", "US").await.unwrap();
    assert_eq!(stations.len(), 2);
}

#[tokio::test]
async fn search_region_matches_city_or_district_token() {
    let db = test_db();
    db.update_station_info(&station("b1", "s1", 45.5, -122.6)).await.unwrap();
    let mut with_district = station("b1", "s2", 47.6, -122.3);
    with_district.city = "Seattle".to_string();
    with_district.district = "Portland".to_string();
    with_district.region = "Washington".to_string();
    db.update_station_info(&with_district).await.unwrap();

    let matches = aggregate::search_region(&db, &["Portland".to_string()]).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().any(|m| m.city == "Portland"));
    assert!(matches.iter().any(|m| m.district == "Portland"));
}

#[tokio::test]
async fn search_region_two_tokens_any_order() {
    let db = test_db();
    db.update_station_info(&station("b1", "s1", 45.5, -122.6)).await.unwrap();

    for tokens in [
        vec!["Oregon".to_string(), "Portland".to_string()],
        vec!["Portland".to_string(), "Oregon".to_string()],
    ] {
        let matches = aggregate::search_region(&db, &tokens).await.unwrap();
        assert_eq!(matches.len(), 1, "tokens: {tokens:?}");
        assert_eq!(matches[0].city, "Portland");
        assert_eq!(matches[0].region, "Oregon");
    }
}

#[tokio::test]
async fn search_region_deduplicates_tuples() {
    let db = test_db();
    // Two stations in the same administrative location.
    db.update_station_info(&station("b1", "s1", 45.5, -122.6)).await.unwrap();
    db.update_station_info(&station("b1", "s2", 45.52, -122.62)).await.unwrap();

    let matches = aggregate::search_region(&db, &["Portland".to_string()]).await.unwrap();
    assert_eq!(matches.len(), 1);
}
