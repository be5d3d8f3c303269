pub mod assignment_sm;
