mod executor_test;
