//! Recipes: the negotiated, ordered field lists of an RTDE stream
//!
//! A recipe is built field by field, sent to the controller as a setup
//! request and becomes active once the controller has confirmed the type of
//! every field. Output recipes decode incoming data packages into their
//! registers; input recipes serialize their registers into outgoing ones.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::catalog::{DataType, Direction, Value};
use crate::token::{RecipeToken, Register, Slot};
use crate::wire::{
    self, PackageHeader, PackageType, DATA_PACKAGE_OVERHEAD, HEADER_SIZE, MAX_PACKAGE_SIZE,
};
use crate::{Result, RtdeError};

pub const DEFAULT_FREQUENCY: f64 = 125.0;

/// Header plus the 8 byte update frequency
const SETUP_OUTPUTS_OVERHEAD: usize = HEADER_SIZE + 8;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Recipe {
    owner: u64,
    direction: Direction,
    frequency: f64,
    tokens: Vec<RecipeToken>,
    registers: Vec<Value>,
    width: usize,
    recipe_id: Option<u8>,
    receive_timestamp: Option<u64>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Recipe {
    /// Empty output recipe at the default frequency
    pub fn new() -> Self {
        Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            direction: Direction::Output,
            frequency: DEFAULT_FREQUENCY,
            tokens: Vec::new(),
            registers: Vec::new(),
            width: 0,
            recipe_id: None,
            receive_timestamp: None,
        }
    }

    /// Empty output recipe updated at `frequency` Hz (1..=125)
    pub fn output(frequency: f64) -> Result<Self> {
        let mut recipe = Self::new();
        recipe.set_frequency(frequency)?;
        Ok(recipe)
    }

    pub fn input() -> Self {
        let mut recipe = Self::new();
        recipe.direction = Direction::Input;
        recipe
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Change direction; only allowed while the recipe has no fields
    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        if self.direction == direction {
            return Ok(());
        }
        if !self.tokens.is_empty() {
            return Err(RtdeError::Precondition(format!(
                "Cannot change direction of a recipe with fields ({})",
                self.fields()
            )));
        }
        self.direction = direction;
        Ok(())
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        if !(1.0..=125.0).contains(&frequency) {
            return Err(RtdeError::Precondition(format!(
                "Output frequency {} outside 1..=125 Hz",
                frequency
            )));
        }
        if self.is_active() {
            return Err(RtdeError::Precondition(
                "Cannot change frequency of a registered recipe".to_string(),
            ));
        }
        self.frequency = frequency;
        Ok(())
    }

    /// Append a field and bind it to a fresh register of type `T`.
    ///
    /// Fails if the name is not in the catalog for this direction, if `T`
    /// cannot hold the field's type, or if the recipe is already registered.
    pub fn add_field<T: Register>(&mut self, name: &str) -> Result<Slot<T>> {
        if self.is_active() {
            return Err(RtdeError::Precondition(format!(
                "Cannot add {} to a registered recipe",
                name
            )));
        }

        let token = RecipeToken::new(name, self.direction, self.width);
        if !token.is_resolved() {
            return Err(RtdeError::UnknownField(format!("{} ({:?})", name, self.direction)));
        }
        let data_type = token.data_type();
        if !T::accepts(data_type) {
            return Err(RtdeError::Precondition(format!(
                "{} is {} and cannot be bound to {}",
                name,
                data_type,
                std::any::type_name::<T>()
            )));
        }

        let width = self.width + token.width();
        if DATA_PACKAGE_OVERHEAD + width > MAX_PACKAGE_SIZE {
            return Err(RtdeError::Precondition(format!(
                "Adding {} would exceed the {} byte package limit",
                name, MAX_PACKAGE_SIZE
            )));
        }
        let names_len = self.names_len() + usize::from(!self.tokens.is_empty()) + name.len();
        if SETUP_OUTPUTS_OVERHEAD + names_len > MAX_PACKAGE_SIZE {
            return Err(RtdeError::Precondition(format!(
                "Adding {} would exceed the {} byte setup message limit",
                name, MAX_PACKAGE_SIZE
            )));
        }

        let index = self.tokens.len();
        self.registers.push(T::default().to_value());
        self.tokens.push(token);
        self.width = width;
        Ok(Slot::new(index, self.owner))
    }

    fn check_slot<T>(&self, slot: &Slot<T>) -> Result<usize> {
        if slot.owner != self.owner || slot.index >= self.registers.len() {
            return Err(RtdeError::Precondition(format!(
                "Slot {} does not belong to this recipe",
                slot.index
            )));
        }
        Ok(slot.index)
    }

    pub fn get<T: Register>(&self, slot: Slot<T>) -> Result<T> {
        let index = self.check_slot(&slot)?;
        T::from_value(self.registers[index]).ok_or_else(|| {
            RtdeError::Precondition(format!("Register {} holds a different type", index))
        })
    }

    pub fn set<T: Register>(&mut self, slot: Slot<T>, value: T) -> Result<()> {
        let index = self.check_slot(&slot)?;
        self.registers[index] = value.to_value();
        Ok(())
    }

    /// Current value of every register, in field order
    pub fn values(&self) -> &[Value] {
        &self.registers
    }

    pub fn tokens(&self) -> &[RecipeToken] {
        &self.tokens
    }

    /// Comma-joined field names, as sent in the setup request
    pub fn fields(&self) -> String {
        self.tokens
            .iter()
            .map(RecipeToken::name)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn names_len(&self) -> usize {
        let names: usize = self.tokens.iter().map(|t| t.name().len()).sum();
        names + self.tokens.len().saturating_sub(1)
    }

    pub fn num_fields(&self) -> usize {
        self.tokens.len()
    }

    /// Payload width of one data package for this recipe
    pub fn expected_bytes(&self) -> usize {
        self.width
    }

    /// Drop every field and return to an empty, unregistered recipe
    pub fn clear_fields(&mut self) {
        self.tokens.clear();
        self.registers.clear();
        self.width = 0;
        self.recipe_id = None;
        // Slots handed out before the clear must not alias the new fields
        self.owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recipe_id(&self) -> Option<u8> {
        self.recipe_id
    }

    pub fn is_active(&self) -> bool {
        self.recipe_id.is_some()
    }

    /// Record the transport receive time of every parsed package
    pub fn track_receive_timestamp(&mut self) {
        self.receive_timestamp = Some(0);
    }

    /// Receive time in nanoseconds of the last parsed package, if tracked
    pub fn receive_timestamp(&self) -> Option<u64> {
        self.receive_timestamp
    }

    /// Setup request announcing this recipe to the controller
    pub fn registration_message(&self) -> Result<Vec<u8>> {
        if self.tokens.is_empty() {
            return Err(RtdeError::Precondition("Cannot register an empty recipe".to_string()));
        }
        let names = self.fields();
        let msg = match self.direction {
            Direction::Output => {
                let header = PackageHeader::new(
                    SETUP_OUTPUTS_OVERHEAD + names.len(),
                    PackageType::ControlPackageSetupOutputs,
                )?;
                let mut msg = header.encode().to_vec();
                msg.extend_from_slice(&wire::encode_network_double(self.frequency));
                msg.extend_from_slice(names.as_bytes());
                msg
            }
            Direction::Input => {
                let header = PackageHeader::new(
                    HEADER_SIZE + names.len(),
                    PackageType::ControlPackageSetupInputs,
                )?;
                let mut msg = header.encode().to_vec();
                msg.extend_from_slice(names.as_bytes());
                msg
            }
        };
        Ok(msg)
    }

    fn setup_type(&self) -> PackageType {
        match self.direction {
            Direction::Output => PackageType::ControlPackageSetupOutputs,
            Direction::Input => PackageType::ControlPackageSetupInputs,
        }
    }

    /// Validate the controller's setup reply and activate the recipe.
    ///
    /// All or nothing: recipe id 0, any rejected field, a NOT_FOUND/IN_USE
    /// anywhere or a different number of types leaves the recipe
    /// unregistered.
    pub fn confirm_registration(&mut self, response: &[u8]) -> Result<u8> {
        self.recipe_id = None;

        let header = PackageHeader::decode(response, Some(self.setup_type()))?;
        let size = header.size as usize;
        if size > response.len() || size < HEADER_SIZE + 1 {
            return Err(RtdeError::MalformedFrame(format!(
                "Setup reply of size {} with {} bytes available",
                size,
                response.len()
            )));
        }
        let recipe_id = response[HEADER_SIZE];
        if recipe_id == 0 {
            return Err(RtdeError::Registration(format!(
                "Controller assigned recipe id 0 to {}",
                self.fields()
            )));
        }
        let types = String::from_utf8_lossy(&response[HEADER_SIZE + 1..size]);
        let types = types.trim_end_matches('\0');
        let types: Vec<&str> = types.split(',').collect();

        let sentinels = [DataType::NotFound.wire_name(), DataType::InUse.wire_name()];
        if let Some(bad) = types.iter().find(|t| sentinels.contains(&t.trim())) {
            return Err(RtdeError::Registration(format!(
                "Controller answered {} for recipe {}",
                bad.trim(),
                self.fields()
            )));
        }

        if types.len() != self.tokens.len() {
            return Err(RtdeError::Registration(format!(
                "Controller returned {} types for {} fields",
                types.len(),
                self.tokens.len()
            )));
        }

        for (token, remote) in self.tokens.iter().zip(&types) {
            if !token.confirm_type(remote) {
                return Err(RtdeError::Registration(format!(
                    "{} is {} locally but {} on the controller",
                    token.name(),
                    token.data_type(),
                    remote.trim()
                )));
            }
        }

        self.recipe_id = Some(recipe_id);
        Ok(recipe_id)
    }

    /// Decode a data package payload (recipe id excluded) into the registers.
    ///
    /// Every field is decoded before any register changes, so a failure
    /// leaves the previous values intact.
    pub fn parse(&mut self, payload: &[u8], receive_timestamp: Option<u64>) -> Result<()> {
        if self.direction != Direction::Output {
            return Err(RtdeError::Precondition("Only output recipes can be parsed".to_string()));
        }
        if payload.len() < self.width {
            return Err(RtdeError::MalformedFrame(format!(
                "Payload of {} bytes, recipe needs {}",
                payload.len(),
                self.width
            )));
        }

        let values = self
            .tokens
            .iter()
            .map(|token| token.parse(payload))
            .collect::<Result<Vec<_>>>()?;
        self.registers = values;

        if self.receive_timestamp.is_some() {
            self.receive_timestamp = Some(receive_timestamp.unwrap_or(0));
        }
        Ok(())
    }

    /// Write a complete data package (header, recipe id, payload) into `out`
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.direction != Direction::Input {
            return Err(RtdeError::Precondition(
                "Only input recipes can be serialized".to_string(),
            ));
        }
        let recipe_id = self.recipe_id.ok_or_else(|| {
            RtdeError::Precondition(format!("Recipe {} is not registered", self.fields()))
        })?;

        out.clear();
        out.extend_from_slice(&wire::data_package_header(recipe_id, self.width)?);
        out.resize(DATA_PACKAGE_OVERHEAD + self.width, 0);

        let payload = &mut out[DATA_PACKAGE_OVERHEAD..];
        for (token, value) in self.tokens.iter().zip(&self.registers) {
            token.store(value, payload)?;
        }
        Ok(())
    }
}
