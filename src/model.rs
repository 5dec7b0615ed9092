use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CLIENTS_IMMUTABLE_FIELD: &str = "CLIENTS/IMMUTABLE_FIELD";
pub const CLIENTS_DECODE_ERROR: &str = "CLIENTS/DECODE";
pub const EXECUTIVES_NO_PRIOR_DATA: &str = "EXECUTIVES/NO_PRIOR_DATA";
pub const PERIOD_INVALID_MONTH: &str = "PERIOD/INVALID_MONTH";
pub const STORE_UNKNOWN_COLLECTION: &str = "STORE/UNKNOWN_COLLECTION";
pub const STORE_INVALID_COLUMN: &str = "STORE/INVALID_COLUMN";

pub const CLIENTES: &str = "clientes";
pub const EJECUTIVOS: &str = "ejecutivos";
pub const PERFILES: &str = "perfiles";

/// Collections this crate is allowed to touch.
pub const COLLECTIONS: &[&str] = &[CLIENTES, EJECUTIVOS, PERFILES];

pub const ESTATUS_DISPERSION: &str = "Dispersión";
pub const ESTATUS_RECHAZADO: &str = "Rechazado";
/// Statuses that stamp `fecha_final` when reached. Matching is exact,
/// case- and accent-sensitive.
pub const ESTATUS_TERMINAL: &[&str] = &[ESTATUS_DISPERSION, ESTATUS_RECHAZADO];

pub const PRODUCTO_NOMINA: &str = "Crédito de nómina";
/// Both spellings occur in stored data.
pub const TIPO_NOMINA: &[&str] = &["nómina", "nomina"];
pub const TIPO_MOTOS: &str = "motos";

/// Fields fixed at creation; `update_field` refuses them.
pub const FIXED_CLIENT_FIELDS: &[&str] = &["id", "mes_registro", "anio_registro"];

/// A loan/credit application row. Unknown columns ride along in `extra` so a
/// decode/encode round trip loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub mes_registro: u32,
    pub anio_registro: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ejecutivo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estatus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monto: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_inicio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_final: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actualizacion: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    pub fn is_terminal(&self) -> bool {
        matches!(self.estatus.as_deref(), Some(s) if ESTATUS_TERMINAL.contains(&s))
    }

    pub fn is_dispersado(&self) -> bool {
        self.estatus.as_deref() == Some(ESTATUS_DISPERSION)
    }
}

/// A sales agent's per-period record. The identifier is fresh every period;
/// `nombre` is the stable cross-period identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executive {
    pub id: i64,
    pub mes: u32,
    pub anio: i32,
    #[serde(default)]
    pub nombre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<f64>,
    #[serde(default = "default_activo", deserialize_with = "flag_from_value")]
    pub activo: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Executive {
    pub fn is_nomina(&self) -> bool {
        matches!(self.tipo.as_deref(), Some(t) if TIPO_NOMINA.contains(&t))
    }

    pub fn is_motos(&self) -> bool {
        self.tipo.as_deref() == Some(TIPO_MOTOS)
    }
}

/// An account profile; only the executive link matters here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ejecutivo_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_activo() -> bool {
    true
}

/// SQLite hands booleans back as 0/1 integers; accept both encodings.
fn flag_from_value<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        other => Err(serde::de::Error::custom(format!(
            "expected bool or 0/1 integer, got {other}"
        ))),
    }
}
