use chrono::{Datelike, Duration, NaiveDate};
use climate_cache::cache::codec::encode;
use climate_cache::cache::document::{CacheDocument, DayValue};
use climate_cache::{compress_years, MeasureRegistry, PlaceRecord};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn thirty_years_of_noon_temperatures(measures: &MeasureRegistry) -> CacheDocument {
    let place = PlaceRecord {
        name: "Austin, TX".to_string(),
        lat: 30.2672,
        lon: -97.7431,
        timezone: "America/Chicago".to_string(),
        grid_lat: 30.25,
        grid_lon: -97.75,
    };
    let mut document = CacheDocument::new(measures.schema().current_version(), place);
    let values = document.data_entry(measures.schema().primary_variable());
    let mut day = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default();
    while day.year() < 2020 {
        values
            .entry(day.year())
            .or_default()
            .entry(day.month())
            .or_default()
            .insert(day.day(), DayValue::Value(f64::from(day.ordinal()) / 10.0));
        day += Duration::days(1);
    }
    document
}

fn bench_summary(c: &mut Criterion) {
    let years: Vec<i32> = (1940..2025).filter(|y| y % 7 != 0).collect();
    c.bench_function("compress_years", |b| {
        b.iter(|| compress_years(black_box(years.iter().copied())))
    });

    let Ok(measures) = MeasureRegistry::load_default() else {
        return;
    };
    let document = thirty_years_of_noon_temperatures(&measures);
    c.bench_function("encode_30_years", |b| {
        b.iter(|| encode(black_box(&document), &measures))
    });
}

criterion_group!(benches, bench_summary);
criterion_main!(benches);
