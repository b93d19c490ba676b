use crate::sink::SinkVariable;
use crate::source::{SensorKind, SourceRecord};

pub const TEMPERATURE_UNIT: &str = "\u{b0}C";

pub fn variable_name(kind: &SensorKind) -> String {
    match kind {
        SensorKind::General { port } => format!("general_{port}"),
        SensorKind::Switch { port } => format!("switch_{port}"),
        SensorKind::Temperature => "temperature".to_string(),
        SensorKind::Humidity => "humidity".to_string(),
        SensorKind::Other(name) => name.to_lowercase(),
    }
}

pub fn unit_for(kind: &SensorKind) -> &'static str {
    match kind {
        SensorKind::Temperature => TEMPERATURE_UNIT,
        SensorKind::General { .. }
        | SensorKind::Switch { .. }
        | SensorKind::Humidity
        | SensorKind::Other(_) => "",
    }
}

pub fn map_record(record: &SourceRecord) -> SinkVariable {
    SinkVariable {
        variable: variable_name(&record.kind),
        value: record.value.clone(),
        time: Some(record.collected_at),
        series: Some(record.collected),
        unit: Some(unit_for(&record.kind).to_string()),
    }
}
