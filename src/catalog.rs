//! RTDE data types and the named-field catalogs
//!
//! The controller publishes a fixed set of named variables (outputs) and
//! accepts a fixed set of named inputs. Each name maps to exactly one
//! [`DataType`], which in turn fixes its width on the wire. The catalogs are
//! built once and never change afterwards.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

/// Degrees of freedom of the arm
pub const DOF: usize = 6;

/// Semantic type of an RTDE field, as named by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Uint8,
    Uint32,
    Uint64,
    Int32,
    Double,
    Vector3d,
    Vector6d,
    Vector6Int32,
    Vector6Uint32,
    String,
    InUse,
    NotFound,
}

impl DataType {
    /// Number of bytes a value of this type occupies in a data package
    pub const fn width(self) -> usize {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::String => 1,
            DataType::Uint32 | DataType::Int32 => 4,
            DataType::Uint64 | DataType::Double => 8,
            DataType::Vector3d => 24,
            DataType::Vector6d => 48,
            DataType::Vector6Int32 | DataType::Vector6Uint32 => 24,
            DataType::InUse | DataType::NotFound => 0,
        }
    }

    /// The name the controller uses for this type in setup responses
    pub const fn wire_name(self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Uint8 => "UINT8",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Int32 => "INT32",
            DataType::Double => "DOUBLE",
            DataType::Vector3d => "VECTOR3D",
            DataType::Vector6d => "VECTOR6D",
            DataType::Vector6Int32 => "VECTOR6INT32",
            DataType::Vector6Uint32 => "VECTOR6UINT32",
            DataType::String => "STRING",
            DataType::InUse => "IN_USE",
            DataType::NotFound => "NOT_FOUND",
        }
    }

    /// Resolve a type name from a setup response.
    ///
    /// Exact, case-sensitive match. Anything unrecognised is `NotFound`.
    pub fn from_wire_name(name: &str) -> DataType {
        match name {
            "BOOL" => DataType::Bool,
            "UINT8" => DataType::Uint8,
            "UINT32" => DataType::Uint32,
            "UINT64" => DataType::Uint64,
            "INT32" => DataType::Int32,
            "DOUBLE" => DataType::Double,
            "VECTOR3D" => DataType::Vector3d,
            "VECTOR6D" => DataType::Vector6d,
            "VECTOR6INT32" => DataType::Vector6Int32,
            "VECTOR6UINT32" => DataType::Vector6Uint32,
            "STRING" => DataType::String,
            "IN_USE" => DataType::InUse,
            _ => DataType::NotFound,
        }
    }

    /// `InUse` and `NotFound` are answers, not types a field can carry
    pub const fn is_sentinel(self) -> bool {
        matches!(self, DataType::InUse | DataType::NotFound)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A decoded field value, one variant per concrete [`DataType`].
///
/// `String` fields are a single ASCII byte on the wire and travel as `U8`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U32(u32),
    U64(u64),
    I32(i32),
    F64(f64),
    Vector3d([f64; 3]),
    Vector6d([f64; DOF]),
    Vector6Int32([i32; DOF]),
    Vector6Uint32([u32; DOF]),
}

impl Value {
    /// Zero value for a type, `None` for the sentinels
    pub fn default_for(data_type: DataType) -> Option<Value> {
        let value = match data_type {
            DataType::Bool => Value::Bool(false),
            DataType::Uint8 | DataType::String => Value::U8(0),
            DataType::Uint32 => Value::U32(0),
            DataType::Uint64 => Value::U64(0),
            DataType::Int32 => Value::I32(0),
            DataType::Double => Value::F64(0.0),
            DataType::Vector3d => Value::Vector3d([0.0; 3]),
            DataType::Vector6d => Value::Vector6d([0.0; DOF]),
            DataType::Vector6Int32 => Value::Vector6Int32([0; DOF]),
            DataType::Vector6Uint32 => Value::Vector6Uint32([0; DOF]),
            DataType::InUse | DataType::NotFound => return None,
        };
        Some(value)
    }

    /// True if this value can be carried by a field of `data_type`
    pub fn fits(&self, data_type: DataType) -> bool {
        matches!(
            (self, data_type),
            (Value::Bool(_), DataType::Bool)
                | (Value::U8(_), DataType::Uint8 | DataType::String)
                | (Value::U32(_), DataType::Uint32)
                | (Value::U64(_), DataType::Uint64)
                | (Value::I32(_), DataType::Int32)
                | (Value::F64(_), DataType::Double)
                | (Value::Vector3d(_), DataType::Vector3d)
                | (Value::Vector6d(_), DataType::Vector6d)
                | (Value::Vector6Int32(_), DataType::Vector6Int32)
                | (Value::Vector6Uint32(_), DataType::Vector6Uint32)
        )
    }
}

/// Which way a field (or a whole recipe) flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Controller to client
    Output,
    /// Client to controller
    Input,
}

/// One entry of a catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

/// Ordered, read-only table of the fields available in one direction
#[derive(Debug)]
pub struct FieldCatalog {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl FieldCatalog {
    fn build(named: &[(&str, DataType)], families: &[RegisterFamily]) -> Self {
        let mut fields = Vec::new();
        for &(name, data_type) in named {
            fields.push(Field { name: name.to_string(), data_type });
        }
        for (prefix, range, data_type) in families {
            for n in range.clone() {
                fields.push(Field { name: format!("{}{}", prefix, n), data_type: *data_type });
            }
        }

        // First occurrence wins; later duplicates stay in the listing only
        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            index.entry(field.name.clone()).or_insert(i);
        }
        Self { fields, index }
    }

    /// Exact, case-sensitive lookup
    pub fn lookup(&self, name: &str) -> DataType {
        self.index
            .get(name)
            .map(|&i| self.fields[i].data_type)
            .unwrap_or(DataType::NotFound)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Numbered register fields: name prefix, index range and type
type RegisterFamily = (&'static str, RangeInclusive<u32>, DataType);

const INPUT_NAMED: &[(&str, DataType)] = &[
    ("speed_slider_mask", DataType::Uint32),
    ("speed_slider_fraction", DataType::Double),
    ("standard_digital_output_mask", DataType::Uint8),
    ("standard_digital_output", DataType::Uint8),
    ("configurable_digital_output_mask", DataType::Uint8),
    ("configurable_digital_output", DataType::Uint8),
    ("tool_digital_output_mask", DataType::Uint8),
    ("tool_digital_output", DataType::Uint8),
    ("standard_analog_output_mask", DataType::Uint8),
    ("standard_analog_output_type", DataType::Uint8),
    ("standard_analog_output_0", DataType::Double),
    ("standard_analog_output_1", DataType::Double),
    ("input_bit_registers0_to_31", DataType::Uint32),
    ("input_bit_registers32_to_63", DataType::Uint32),
];

const INPUT_REGISTERS: &[RegisterFamily] = &[
    ("input_bit_register_", 64..=127, DataType::Bool),
    ("input_int_register_", 0..=47, DataType::Int32),
    ("input_double_register_", 0..=47, DataType::Double),
];

const OUTPUT_NAMED: &[(&str, DataType)] = &[
    ("timestamp", DataType::Double),
    ("target_q", DataType::Vector6d),
    ("target_qd", DataType::Vector6d),
    ("target_qdd", DataType::Vector6d),
    ("target_current", DataType::Vector6d),
    ("target_moment", DataType::Vector6d),
    ("actual_q", DataType::Vector6d),
    ("actual_qd", DataType::Vector6d),
    ("actual_current", DataType::Vector6d),
    ("joint_control_output", DataType::Vector6d),
    ("actual_TCP_pose", DataType::Vector6d),
    ("actual_TCP_speed", DataType::Vector6d),
    ("actual_TCP_force", DataType::Vector6d),
    ("target_TCP_pose", DataType::Vector6d),
    ("target_TCP_speed", DataType::Vector6d),
    ("actual_digital_input_bits", DataType::Uint64),
    ("joint_temperatures", DataType::Vector6d),
    ("actual_execution_time", DataType::Double),
    ("robot_mode", DataType::Int32),
    ("joint_mode", DataType::Vector6Int32),
    ("safety_mode", DataType::Int32),
    ("safety_status", DataType::Int32),
    ("actual_tool_accelerometer", DataType::Vector3d),
    ("speed_scaling", DataType::Double),
    ("target_speed_fraction", DataType::Double),
    ("actual_momentum", DataType::Double),
    ("actual_main_voltage", DataType::Double),
    ("actual_robot_voltage", DataType::Double),
    ("actual_robot_current", DataType::Double),
    ("actual_joint_voltage", DataType::Vector6d),
    ("actual_digital_output_bits", DataType::Uint64),
    ("runtime_state", DataType::Uint32),
    ("elbow_position", DataType::Vector3d),
    ("elbow_velocity", DataType::Vector3d),
    ("robot_status_bits", DataType::Uint32),
    ("safety_status_bits", DataType::Uint32),
    ("analog_io_types", DataType::Uint32),
    ("standard_analog_input0", DataType::Double),
    ("standard_analog_input1", DataType::Double),
    ("standard_analog_output0", DataType::Double),
    ("standard_analog_output1", DataType::Double),
    ("io_current", DataType::Double),
    ("euromap67_input_bits", DataType::Uint32),
    ("euromap67_output_bits", DataType::Uint32),
    ("euromap67_24V_voltage", DataType::Double),
    ("euromap67_24V_current", DataType::Double),
    ("tool_mode", DataType::Uint32),
    ("tool_analog_input_types", DataType::Uint32),
    ("tool_analog_input0", DataType::Double),
    ("tool_analog_input1", DataType::Double),
    ("tool_output_voltage", DataType::Int32),
    ("tool_output_current", DataType::Double),
    ("tool_temperature", DataType::Double),
    ("tcp_force_scalar", DataType::Double),
    ("output_bit_registers0_to_31", DataType::Uint32),
    ("output_bit_registers32_to_63", DataType::Uint32),
    ("input_bit_registers0_to_31", DataType::Uint32),
    ("input_bit_registers32_to_63", DataType::Uint32),
    ("tool_output_mode", DataType::Uint8),
    ("tool_digital_output0_mode", DataType::Uint8),
    ("tool_digital_output1_mode", DataType::Uint8),
];

// Input registers can be read back through the output stream
const OUTPUT_REGISTERS: &[RegisterFamily] = &[
    ("output_bit_register_", 64..=127, DataType::Bool),
    ("output_int_register_", 0..=47, DataType::Int32),
    ("output_double_register_", 0..=47, DataType::Double),
    ("input_bit_register_", 64..=127, DataType::Bool),
    ("input_int_register_", 0..=47, DataType::Int32),
    ("input_double_register_", 0..=47, DataType::Double),
];

/// Fields a client may write (client to controller)
pub fn input_catalog() -> &'static FieldCatalog {
    static CATALOG: OnceLock<FieldCatalog> = OnceLock::new();
    CATALOG.get_or_init(|| FieldCatalog::build(INPUT_NAMED, INPUT_REGISTERS))
}

/// Fields the controller publishes (controller to client)
pub fn output_catalog() -> &'static FieldCatalog {
    static CATALOG: OnceLock<FieldCatalog> = OnceLock::new();
    CATALOG.get_or_init(|| FieldCatalog::build(OUTPUT_NAMED, OUTPUT_REGISTERS))
}

pub fn catalog(direction: Direction) -> &'static FieldCatalog {
    match direction {
        Direction::Output => output_catalog(),
        Direction::Input => input_catalog(),
    }
}

/// Type of an output field, `NotFound` if the controller has no such output
pub fn lookup_type(name: &str) -> DataType {
    output_catalog().lookup(name)
}

pub fn lookup_input_type(name: &str) -> DataType {
    input_catalog().lookup(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lookup_is_exact() {
        assert_eq!(lookup_type("timestamp"), DataType::Double);
        assert_eq!(lookup_type("target_q"), DataType::Vector6d);
        assert_eq!(lookup_type("joint_mode"), DataType::Vector6Int32);
        assert_eq!(lookup_type("unknown_field"), DataType::NotFound);
        assert_eq!(lookup_type("Timestamp"), DataType::NotFound);
        assert_eq!(lookup_type("timestamp "), DataType::NotFound);
        assert_eq!(lookup_type(""), DataType::NotFound);
    }

    #[test]
    fn test_register_families() {
        assert_eq!(lookup_type("output_int_register_0"), DataType::Int32);
        assert_eq!(lookup_type("output_int_register_47"), DataType::Int32);
        assert_eq!(lookup_type("output_int_register_48"), DataType::NotFound);
        assert_eq!(lookup_type("output_int_register_07"), DataType::NotFound);
        assert_eq!(lookup_type("output_bit_register_64"), DataType::Bool);
        assert_eq!(lookup_type("output_bit_register_63"), DataType::NotFound);
        assert_eq!(lookup_type("input_double_register_5"), DataType::Double);

        assert_eq!(lookup_input_type("input_int_register_20"), DataType::Int32);
        assert_eq!(lookup_input_type("input_bit_register_127"), DataType::Bool);
        assert_eq!(lookup_input_type("output_int_register_0"), DataType::NotFound);
        assert_eq!(lookup_input_type("timestamp"), DataType::NotFound);
    }

    #[test]
    fn test_catalog_order_and_duplicates() {
        let out = output_catalog();
        assert_eq!(out.fields()[0].name, "timestamp");
        assert_eq!(out.fields()[1].name, "target_q");
        // 61 named + 64 + 48 + 48 + 64 + 48 + 48
        assert_eq!(out.len(), 61 + 320);
        assert!(out.contains("input_bit_registers0_to_31"));

        let inp = input_catalog();
        assert_eq!(inp.fields()[0].name, "speed_slider_mask");
        assert_eq!(inp.len(), 14 + 64 + 48 + 48);
    }

    #[test]
    fn test_type_widths() {
        assert_eq!(DataType::Bool.width(), 1);
        assert_eq!(DataType::Int32.width(), 4);
        assert_eq!(DataType::Double.width(), 8);
        assert_eq!(DataType::Vector3d.width(), 24);
        assert_eq!(DataType::Vector6d.width(), 48);
        assert_eq!(DataType::Vector6Int32.width(), 24);
        assert_eq!(DataType::NotFound.width(), 0);
        assert_eq!(DataType::InUse.width(), 0);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(DataType::from_wire_name("VECTOR6D"), DataType::Vector6d);
        assert_eq!(DataType::from_wire_name("IN_USE"), DataType::InUse);
        assert_eq!(DataType::from_wire_name("NOT_FOUND"), DataType::NotFound);
        assert_eq!(DataType::from_wire_name("double"), DataType::NotFound);
        assert_eq!(DataType::from_wire_name("DOUBLEE"), DataType::NotFound);
        for t in [DataType::Bool, DataType::Uint64, DataType::Vector6Uint32] {
            assert_eq!(DataType::from_wire_name(t.wire_name()), t);
        }
    }
}
