//! Random password generator.
//!
//! Exact class counts are honoured: `digits` digits, `symbols` symbols, and
//! letters for the remainder. Positions are shuffled with the OS CSPRNG.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::controller::generator::GeneratorError;
use crate::crd::PasswordSpec;
use crate::secret::SecretValue;

pub const DIGITS: &[u8] = b"0123456789";
pub const SYMBOLS: &[u8] = b"~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";
pub const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
pub const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn letters(no_upper: bool) -> Vec<u8> {
    let mut letters = LOWERCASE.to_vec();
    if !no_upper {
        letters.extend_from_slice(UPPERCASE);
    }
    letters
}

/// Check the parameters without generating anything
pub fn validate(spec: &PasswordSpec) -> Result<(), GeneratorError> {
    if spec.length == 0 {
        return Err(GeneratorError::InvalidSpec(
            "password length must be greater than 0".to_string(),
        ));
    }
    let fixed = spec.digits.saturating_add(spec.symbols);
    if fixed > spec.length {
        return Err(GeneratorError::InvalidSpec(format!(
            "digits ({}) + symbols ({}) exceed length ({})",
            spec.digits, spec.symbols, spec.length
        )));
    }
    if !spec.allow_repeat {
        let letter_count = spec.length - fixed;
        for (class, requested, available) in [
            ("digit", spec.digits, DIGITS.len()),
            ("symbol", spec.symbols, SYMBOLS.len()),
            ("letter", letter_count, letters(spec.no_upper).len()),
        ] {
            if requested > available {
                return Err(GeneratorError::ExhaustedAlphabet {
                    class,
                    requested,
                    available,
                });
            }
        }
    }
    Ok(())
}

fn draw(rng: &mut OsRng, alphabet: &[u8], count: usize, allow_repeat: bool, out: &mut Vec<u8>) {
    if allow_repeat {
        out.extend((0..count).map(|_| alphabet[rng.gen_range(0..alphabet.len())]));
    } else {
        out.extend(alphabet.choose_multiple(rng, count).copied());
    }
}

/// Generate a password satisfying `spec`
pub fn generate(spec: &PasswordSpec) -> Result<SecretValue, GeneratorError> {
    validate(spec)?;

    let mut rng = OsRng;
    let mut chars = Vec::with_capacity(spec.length);
    draw(&mut rng, DIGITS, spec.digits, spec.allow_repeat, &mut chars);
    draw(&mut rng, SYMBOLS, spec.symbols, spec.allow_repeat, &mut chars);
    draw(
        &mut rng,
        &letters(spec.no_upper),
        spec.length - spec.digits - spec.symbols,
        spec.allow_repeat,
        &mut chars,
    );
    chars.shuffle(&mut rng);
    Ok(SecretValue::new(chars))
}
