// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use crate::util::encode_u32;
use core::convert::Into;

/// Trait for types that allow you to append CoAP options to them.
pub trait OptionInsert {
    /// Appends an option with the given bytes as the value. Options must be
    /// appended in ascending option-number order.
    fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error>;

    /// Appends an option with no value.
    fn insert_option_empty(&mut self, key: OptionNumber) -> Result<(), Error> {
        self.insert_option_with_bytes(key, &[])
    }

    /// Appends an option with a string value.
    fn insert_option_with_str(&mut self, key: OptionNumber, value: &str) -> Result<(), Error> {
        self.insert_option_with_bytes(key, value.as_bytes())
    }

    /// Appends an option with an integer value.
    fn insert_option_with_u32(&mut self, key: OptionNumber, value: u32) -> Result<(), Error> {
        self.insert_option_with_bytes(key, encode_u32(value, &mut [0; 4]))
    }
}

/// Extension trait providing a single typed `insert_option` entry point.
pub trait OptionInsertExt {
    /// Appends an option with a value of the appropriate type for its key.
    fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<OptionValue<'a>>;
}

impl<O> OptionInsertExt for O
where
    O: OptionInsert + ?Sized,
{
    fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<OptionValue<'a>>,
    {
        match value.into() {
            OptionValue::Integer(x) => self.insert_option_with_u32(key.0, x),
            OptionValue::Bytes(x) => self.insert_option_with_bytes(key.0, x),
            OptionValue::ETag(x) => self.insert_option_with_bytes(key.0, x.as_bytes()),
        }
    }
}
