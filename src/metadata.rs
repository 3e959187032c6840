//! Metadata seam between the disassembler and the host binary.
//!
//! The disassembler never parses the host binary. Whenever an instruction
//! references managed metadata - a catch type, a field, a method the v-call
//! bridge invokes - it resolves the VM-level id through the [`MetadataImage`]
//! trait, implemented by the surrounding tooling over its own metadata reader.
//!
//! Tokens follow the ECMA-335 shape: high byte selects the table, low 24 bits
//! the row.

use std::fmt;

use bitflags::bitflags;

use crate::{architecture::VMType, Result};

/// A metadata token referencing an entry of the host binary's metadata tables.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a token from a raw 32-bit value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte).
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits).
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

bitflags! {
    /// Token categories a VM-level id is allowed to resolve into.
    ///
    /// Resolution sites pass the categories valid in their context: a catch
    /// clause accepts type tokens only, the ECALL bridge accepts method-shaped
    /// tokens, `TOKEN` accepts anything handle-shaped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenCategory: u16 {
        /// TypeDef rows.
        const TYPE_DEF = 0x0001;
        /// TypeRef rows.
        const TYPE_REF = 0x0002;
        /// TypeSpec rows.
        const TYPE_SPEC = 0x0004;
        /// MethodDef rows.
        const METHOD_DEF = 0x0008;
        /// MemberRef rows.
        const MEMBER_REF = 0x0010;
        /// MethodSpec rows.
        const METHOD_SPEC = 0x0020;
        /// Field rows.
        const FIELD_DEF = 0x0040;

        /// Any type-shaped token.
        const TYPE = Self::TYPE_DEF.bits() | Self::TYPE_REF.bits() | Self::TYPE_SPEC.bits();
        /// Any method-shaped token.
        const METHOD = Self::METHOD_DEF.bits() | Self::MEMBER_REF.bits() | Self::METHOD_SPEC.bits();
        /// Any field-shaped token.
        const FIELD = Self::FIELD_DEF.bits() | Self::MEMBER_REF.bits();
    }
}

bitflags! {
    /// Calling-convention flags of a devirtualized function signature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignatureFlags: u8 {
        /// The function takes a `this` argument before its declared parameters.
        const HAS_THIS = 0x01;
    }
}

/// Signature of a devirtualized function.
///
/// Parameter and return types are carried as metadata tokens; the disassembler
/// only needs their count, the instance flag, and the VM-level width of the
/// return type (resolved through [`MetadataImage::return_type`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    /// Calling-convention flags.
    pub flags: SignatureFlags,
    /// Declared parameter types, leftmost first.
    pub param_tokens: Vec<Token>,
    /// Return type token.
    pub return_token: Token,
}

impl FunctionSignature {
    /// Returns `true` when the signature takes a `this` argument.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.flags.contains(SignatureFlags::HAS_THIS)
    }

    /// Number of declared parameters, excluding `this`.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.param_tokens.len()
    }
}

/// The call-relevant shape of a metadata method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodShape {
    /// Number of declared parameters, excluding `this`.
    pub param_count: usize,
    /// Whether the method takes a `this` argument.
    pub is_instance: bool,
    /// VM-level width of the return value, `None` for void.
    pub return_type: Option<VMType>,
}

/// Read-only view of the host binary's metadata image.
///
/// Implementations resolve the VM's obfuscated reference ids into metadata
/// tokens and answer shape queries about the referenced members. All methods
/// take the offset of the querying instruction so failures can name their
/// site.
pub trait MetadataImage {
    /// Maps a VM-level id to a metadata token within the allowed categories.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TokenResolution`] when the id maps to no token
    /// or only to tokens outside `allowed`.
    fn resolve_reference(&self, offset: u64, id: u32, allowed: TokenCategory) -> Result<Token>;

    /// Returns the call shape of a method-shaped token.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TokenResolution`] when the token does not
    /// reference a method.
    fn method_shape(&self, offset: u64, token: Token) -> Result<MethodShape>;

    /// Returns the VM-level type of a field-shaped token.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TokenResolution`] when the token does not
    /// reference a field.
    fn field_type(&self, offset: u64, token: Token) -> Result<VMType>;

    /// Returns the VM-level return type behind a type token, `None` for void.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TokenResolution`] when the token does not
    /// reference a type.
    fn return_type(&self, offset: u64, token: Token) -> Result<Option<VMType>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_fields() {
        let token = Token::new(0x0600_0001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
        assert!(!token.is_null());
        assert!(Token::new(0).is_null());
    }

    #[test]
    fn token_display() {
        assert_eq!(Token::new(0x0200_0005).to_string(), "0x02000005");
    }

    #[test]
    fn category_composites() {
        assert!(TokenCategory::TYPE.contains(TokenCategory::TYPE_SPEC));
        assert!(TokenCategory::METHOD.contains(TokenCategory::MEMBER_REF));
        assert!(!TokenCategory::TYPE.contains(TokenCategory::FIELD_DEF));
    }

    #[test]
    fn signature_shape() {
        let signature = FunctionSignature {
            flags: SignatureFlags::HAS_THIS,
            param_tokens: vec![Token::new(0x0100_0001), Token::new(0x0100_0002)],
            return_token: Token::new(0x0100_0003),
        };
        assert!(signature.is_instance());
        assert_eq!(signature.param_count(), 2);
    }
}
