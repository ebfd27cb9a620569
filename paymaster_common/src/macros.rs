//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.




/// Macro to shorten the case where you want to unwrap something
/// or run some code otherwise.
#[macro_export]
macro_rules! unwrap_opt_or {
    ($maybe:expr, $else:tt) => {
        if let Some(v) = $maybe {
            v
        } else {
            $else
        }
    }
}

#[cfg(test)]
mod test {
    fn opt_return_false_on_else(opt: Option<usize>) -> bool {
        let _x: usize = unwrap_opt_or!(opt, {
            return false;
        });
        return true;
    }

    #[test]
    fn test_unwrap_opt_or() {
        let opt = Some(5);
        assert_eq!(unwrap_opt_or!(opt, { panic!("foo"); }), 5);

        assert!(opt_return_false_on_else(Some(5)));
        assert!(!opt_return_false_on_else(None));
    }
}
